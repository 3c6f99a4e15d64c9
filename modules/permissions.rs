//! Permission groups for players, managed from the console.

use std::collections::{BTreeMap, BTreeSet};

/// How a permission change is applied.
pub enum Scope {
    Player,
    Group,
}

#[derive(Default)]
pub struct Permissions {
    grants: BTreeMap<String, BTreeSet<String>>,
}

impl ServerModule for Permissions {
    fn on_modules_loaded(&mut self) {
        self.grants
            .entry("admin".to_string())
            .or_default()
            .insert("*".to_string());
    }
}

impl Permissions {
    #[command("perm add", description = "Grants a permission to a player or group")]
    fn add(&mut self, subject: String, permission: String, #[default(Player)] scope: Scope) -> String {
        let label = match scope {
            Scope::Player => "player",
            Scope::Group => "group",
        };
        self.grants
            .entry(subject.clone())
            .or_default()
            .insert(permission.clone());
        format!("Granted {} to {} {}", permission, label, subject)
    }

    #[command("perm remove", description = "Revokes a permission")]
    fn remove(&mut self, subject: String, permission: String) -> Result<String, String> {
        match self.grants.get_mut(&subject) {
            Some(set) if set.remove(&permission) => Ok(format!("Revoked {} from {}", permission, subject)),
            _ => Err(format!("{} does not have {}", subject, permission)),
        }
    }

    #[command("perm list", description = "Lists permissions")]
    fn list(&self, subject: Option<String>) -> String {
        let mut lines = Vec::new();
        for (name, set) in &self.grants {
            if subject.as_ref().is_some_and(|wanted| wanted != name) {
                continue;
            }
            let permissions: Vec<&str> = set.iter().map(String::as_str).collect();
            lines.push(format!("{}: {}", name, permissions.join(", ")));
        }
        if lines.is_empty() {
            "No permissions granted".to_string()
        } else {
            lines.join("\n")
        }
    }

    #[command("perm check")]
    fn check(&self, subject: String, permission: String) -> String {
        let granted = self
            .grants
            .get(&subject)
            .is_some_and(|set| set.contains("*") || set.contains(&permission));
        format!("{} {} {}", subject, if granted { "has" } else { "lacks" }, permission)
    }
}
