use crate::config::{LabelsConfig, Validatable};
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelsError {
    #[error("Failed to read labels file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassLabel {
    pub label: String,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

#[derive(Debug, Clone, Default)]
pub struct ClassLabels {
    labels: Vec<ClassLabel>,
}

impl ClassLabels {
    pub fn new(labels: Vec<ClassLabel>) -> Self {
        Self { labels }
    }

    pub fn load(config: &LabelsConfig) -> Result<Self, LabelsError> {
        let labels = load_labels(&config.get_path())?;
        tracing::info!("Loaded {} class labels", labels.len());
        Ok(Self { labels })
    }

    pub fn get(&self, class_id: u32) -> Option<&ClassLabel> {
        self.labels.get(class_id as usize)
    }

    pub fn name(&self, class_id: u32) -> String {
        match self.get(class_id) {
            Some(class_label) => class_label.label.clone(),
            None => format!("Unknown class {}", class_id),
        }
    }

    /// Falls back to green for ids outside the labels file.
    pub fn color(&self, class_id: u32) -> (u8, u8, u8) {
        self.get(class_id)
            .map(|l| (l.red, l.green, l.blue))
            .unwrap_or((0, 255, 0))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Reads one `label,red,green,blue` entry per line. Blank lines are skipped.
pub fn load_labels(filepath: &Path) -> Result<Vec<ClassLabel>, LabelsError> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut class_labels = Vec::new();

    for (index, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() != 4 {
            return Err(LabelsError::InvalidLine {
                line: index + 1,
                reason: format!("expected 4 fields, got {}", parts.len()),
            });
        }

        let channel = |name: &str, value: &str| {
            value
                .trim()
                .parse::<u8>()
                .map_err(|_| LabelsError::InvalidLine {
                    line: index + 1,
                    reason: format!("invalid {} value `{}`", name, value.trim()),
                })
        };

        class_labels.push(ClassLabel {
            label: parts[0].trim().to_string(),
            red: channel("red", parts[1])?,
            green: channel("green", parts[2])?,
            blue: channel("blue", parts[3])?,
        });
    }

    Ok(class_labels)
}
