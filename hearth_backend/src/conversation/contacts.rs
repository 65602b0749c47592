use std::collections::HashMap;

use crate::config::ContactEntry;

#[derive(Debug, Clone)]
struct Contact {
    alias: String,
    role: String,
}

/// Read-only handle → alias/role lookup, built once at INIT.
#[derive(Debug, Clone)]
pub struct ContactBook {
    by_handle: HashMap<String, Contact>,
    bot_name: String,
}

fn normalize(handle: &str) -> String {
    handle.trim().to_lowercase()
}

impl ContactBook {
    pub fn new(entries: &[ContactEntry], bot_name: impl Into<String>) -> Self {
        let mut by_handle = HashMap::new();
        for entry in entries {
            let role = entry
                .role
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .unwrap_or("other")
                .to_lowercase();
            for handle in &entry.handles {
                let key = normalize(handle);
                if key.is_empty() {
                    continue;
                }
                by_handle.insert(
                    key,
                    Contact {
                        alias: entry.alias.clone(),
                        role: role.clone(),
                    },
                );
            }
        }

        Self {
            by_handle,
            bot_name: bot_name.into(),
        }
    }

    pub fn bot_name(&self) -> &str {
        &self.bot_name
    }

    /// Display alias for `sender`. Unknown handles are returned unchanged.
    pub fn resolve<'a>(&'a self, sender: &'a str, is_self: bool) -> &'a str {
        if is_self {
            return &self.bot_name;
        }
        if sender.trim().is_empty() {
            return "Unknown";
        }
        self.by_handle
            .get(&normalize(sender))
            .map(|c| c.alias.as_str())
            .unwrap_or(sender)
    }

    /// Relationship label used in role-tagged prompts (`mom`, `dad`, `other`, ...).
    pub fn role(&self, sender: &str, is_self: bool) -> &str {
        if is_self {
            return "assistant";
        }
        self.by_handle
            .get(&normalize(sender))
            .map(|c| c.role.as_str())
            .unwrap_or("other")
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> ContactBook {
        ContactBook::new(
            &[
                ContactEntry {
                    alias: "Mom".to_string(),
                    handles: vec!["Mom@Example.com".to_string(), "+15550001111".to_string()],
                    role: Some("mom".to_string()),
                },
                ContactEntry {
                    alias: "Uncle Li".to_string(),
                    handles: vec!["li@example.com".to_string()],
                    role: None,
                },
            ],
            "Meg",
        )
    }

    #[test]
    fn resolves_handles_case_insensitively() {
        let contacts = book();
        assert_eq!(contacts.resolve("  mom@example.COM ", false), "Mom");
        assert_eq!(contacts.resolve("+15550001111", false), "Mom");
        assert_eq!(contacts.role("+15550001111", false), "mom");
        assert_eq!(contacts.len(), 3);
    }

    #[test]
    fn unknown_and_self_senders_fall_back() {
        let contacts = book();
        assert_eq!(contacts.resolve("stranger@example.com", false), "stranger@example.com");
        assert_eq!(contacts.resolve("", false), "Unknown");
        assert_eq!(contacts.resolve("anything", true), "Meg");
        assert_eq!(contacts.role("li@example.com", false), "other");
        assert_eq!(contacts.role("anything", true), "assistant");
    }
}
