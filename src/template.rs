use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A declarative machine template: what to run once at install time, what to
/// run on every launch, and the properties those task lines may reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Template identifier (stable across catalog versions).
    pub id: String,
    /// Human-readable name. Used as the session's default display name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Icon URL to display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Free-form requirements declared by the template author.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Tasks executed once, before the first launch.
    #[serde(default)]
    pub install_tasks: Vec<String>,
    /// Tasks executed on every launch.
    #[serde(default)]
    pub run_tasks: Vec<String>,
    /// Named properties, available to task lines as `${name}`.
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read template {}: {}", .0.display(), .1)]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to parse template {}: {}", .0.display(), .1)]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("failed to write template {}: {}", .0.display(), .1)]
    Write(PathBuf, #[source] std::io::Error),
    #[error("failed to serialize template: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl Template {
    /// Look up a template property.
    pub fn prop(&self, name: &str) -> Option<&str> {
        self.props.get(name).map(String::as_str)
    }

    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TemplateError::Read(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| TemplateError::Parse(path.to_path_buf(), e))
    }

    pub fn save(&self, path: &Path) -> Result<(), TemplateError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|e| TemplateError::Write(path.to_path_buf(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_template() {
        let toml = r#"
            id = "alpine"
            name = "Alpine Linux"
            run_tasks = ["qemu-system-${system.arch} -m 512"]
        "#;
        let template: Template = toml::from_str(toml).unwrap();
        assert_eq!(template.id, "alpine");
        assert!(template.install_tasks.is_empty());
        assert!(template.props.is_empty());
        assert_eq!(template.run_tasks.len(), 1);
    }

    #[test]
    fn parse_full_template() {
        let toml = r#"
            id = "debian"
            name = "Debian"
            description = "Debian stable"
            requires = ["network"]
            install_tasks = [
                "echo Downloading",
                "download disk.iso ${iso_url}",
            ]
            run_tasks = ["echo Starting"]

            [props]
            iso_url = "https://example.com/debian.iso"
        "#;
        let template: Template = toml::from_str(toml).unwrap();
        assert_eq!(template.prop("iso_url"), Some("https://example.com/debian.iso"));
        assert_eq!(template.requires, vec!["network"]);
        assert_eq!(template.install_tasks.len(), 2);
        assert_eq!(template.description.as_deref(), Some("Debian stable"));
    }

    #[test]
    fn save_and_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.toml");
        let mut template = Template {
            id: "t".into(),
            name: "Test".into(),
            run_tasks: vec!["echo hi".into()],
            ..Default::default()
        };
        template.props.insert("mem".into(), "1024".into());
        template.save(&path).unwrap();

        let loaded = Template::load(&path).unwrap();
        assert_eq!(loaded, template);
    }

    #[test]
    fn load_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Template::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, TemplateError::Read(..)));
    }
}
