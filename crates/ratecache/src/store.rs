//! Atomic read/write of the JSON rate-cache file: write to a sibling temp
//! file, then rename over the destination so a reader never observes a
//! partially-written file (§4 "File-storage primitives").

use std::path::Path;

use serde_json::Value;

pub fn read(path: &Path) -> Value {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|_| Value::Object(Default::default())),
        Err(_) => Value::Object(Default::default()),
    }
}

pub fn write(path: &Path, value: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let contents = serde_json::to_string_pretty(value).expect("rate cache value serializes");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
