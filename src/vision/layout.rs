// Field landmark layout: tag id -> 3D field pose
//
// A tag's +x axis points out of its face, into the field.

use std::collections::HashMap;
use std::path::Path;

use nalgebra::Isometry3;
use serde::Deserialize;
use tracing::info;

use crate::config::ConfigError;
use crate::geometry::RigidTransform;

const BUILTIN_LAYOUT: &str = include_str!("../../assets/field_layout.json");

#[derive(Debug, Deserialize)]
struct LayoutFile {
    field: FieldSize,
    tags: Vec<TagEntry>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct FieldSize {
    length: f64,
    width: f64,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    id: u32,
    pose: RigidTransform,
}

#[derive(Debug, Clone)]
pub struct FieldLayout {
    field_length: f64,
    field_width: f64,
    tags: HashMap<u32, Isometry3<f64>>,
}

impl FieldLayout {
    /// Layout compiled into the binary
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_json(BUILTIN_LAYOUT, "<builtin>")
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let layout = Self::from_json(&text, &path.display().to_string())?;
        info!("Loaded {} tags from {}", layout.len(), path.display());
        Ok(layout)
    }

    pub fn from_json(text: &str, source_name: &str) -> Result<Self, ConfigError> {
        let file: LayoutFile = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: source_name.to_string(),
            source,
        })?;

        if !(file.field.length > 0.0 && file.field.width > 0.0) {
            return Err(ConfigError::InvalidLayout(format!(
                "field size {} x {} must be positive",
                file.field.length, file.field.width
            )));
        }

        let mut tags = HashMap::with_capacity(file.tags.len());
        for tag in file.tags {
            let p = tag.pose;
            if ![p.x, p.y, p.z, p.roll, p.pitch, p.yaw].iter().all(|v| v.is_finite()) {
                return Err(ConfigError::InvalidLayout(format!("tag {} has a non-finite pose", tag.id)));
            }
            if tags.insert(tag.id, p.to_isometry()).is_some() {
                return Err(ConfigError::InvalidLayout(format!("tag {} listed twice", tag.id)));
            }
        }

        Ok(Self {
            field_length: file.field.length,
            field_width: file.field.width,
            tags,
        })
    }

    pub fn tag_pose(&self, id: u32) -> Option<&Isometry3<f64>> {
        self.tags.get(&id)
    }

    pub fn tags(&self) -> impl Iterator<Item = (u32, &Isometry3<f64>)> {
        self.tags.iter().map(|(id, pose)| (*id, pose))
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn field_length(&self) -> f64 {
        self.field_length
    }

    pub fn field_width(&self) -> f64 {
        self.field_width
    }
}
