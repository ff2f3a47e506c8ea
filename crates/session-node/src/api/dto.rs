use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct ShutterRequest {
  pub on: bool,
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
  pub mode: String,
}

#[derive(Debug, Deserialize)]
pub struct VideoSettingsRequest {
  pub resolution: String,
  pub fps: String,
  pub fov: String,
}

/// Fills in `dir` for a Save request body that leaves it out.
pub fn apply_default_save_dir(body: &mut Value, save_dir: &Path) {
  let Some(obj) = body.as_object_mut() else { return };
  if obj.get("mode").and_then(Value::as_str) != Some("save") || obj.contains_key("dir") {
    return;
  }
  obj.insert("dir".into(), Value::String(save_dir.to_string_lossy().into_owned()));
}
