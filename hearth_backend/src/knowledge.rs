//! Personal knowledge base handed to the responder as background context.

use std::fs;
use std::path::Path;

use crate::error::ConfigurationError;

#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    text: String,
}

impl KnowledgeBase {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into().trim().to_string(),
        }
    }

    /// Loads the file at `path`. `.toml` files are flattened into
    /// `key: value` lines; anything else is used verbatim.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let unreadable = |reason: String| ConfigurationError::Unreadable {
            what: "knowledge base",
            path: path.display().to_string(),
            reason,
        };
        let contents = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if !is_toml {
            return Ok(Self::from_text(contents));
        }

        let table: toml::Table = toml::from_str(&contents).map_err(|e| unreadable(e.to_string()))?;
        let mut lines = Vec::new();
        flatten("", &table, &mut lines);
        Ok(Self::from_text(lines.join("\n")))
    }

    /// Loads the configured knowledge file, or an empty base when none is set.
    pub fn from_config(path: Option<&str>) -> Result<Self, ConfigurationError> {
        match path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => {
                let kb = Self::load(Path::new(path))?;
                tracing::info!("Loaded knowledge base from {} ({} chars)", path, kb.text.len());
                Ok(kb)
            }
            None => Ok(Self::empty()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut Vec<String>) {
    for (key, value) in table {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            toml::Value::Table(inner) => flatten(&key, inner, out),
            toml::Value::String(s) => out.push(format!("{}: {}", key, s)),
            toml::Value::Array(items) => {
                let rendered: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        toml::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                out.push(format!("{}: {}", key, rendered.join(", ")));
            }
            other => out.push(format!("{}: {}", key, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn toml_knowledge_is_flattened() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
city = "Seattle"
hobbies = ["climbing", "baking"]

[work]
team = "infra"
"#
        )
        .unwrap();

        let kb = KnowledgeBase::load(file.path()).unwrap();
        let text = kb.as_str();
        assert!(text.contains("city: Seattle"));
        assert!(text.contains("hobbies: climbing, baking"));
        assert!(text.contains("work.team: infra"));
    }

    #[test]
    fn plain_text_is_used_verbatim() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  Lives in Seattle.\nLikes tea.  ").unwrap();
        let kb = KnowledgeBase::load(file.path()).unwrap();
        assert_eq!(kb.as_str(), "Lives in Seattle.\nLikes tea.");
    }

    #[test]
    fn missing_configured_file_is_fatal_but_unset_is_empty() {
        assert!(KnowledgeBase::from_config(None).unwrap().is_empty());
        assert!(KnowledgeBase::from_config(Some("  ")).unwrap().is_empty());

        let err = KnowledgeBase::from_config(Some("/nonexistent/knowledge.toml")).unwrap_err();
        assert!(matches!(err, ConfigurationError::Unreadable { what: "knowledge base", .. }));
    }
}
