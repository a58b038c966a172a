use serde::{Deserialize, Serialize};

/// Architecture plan produced by the planning phase and injected into the
/// code-generation prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchitecturePlan {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub models: Vec<PlanModel>,
    #[serde(default)]
    pub routes: Vec<PlanRoute>,
    #[serde(default)]
    pub components: Vec<PlanComponent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanModel {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRoute {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanComponent {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl ArchitecturePlan {
    /// A plan with nothing to build.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty() && self.routes.is_empty() && self.components.is_empty()
    }

    /// Markdown rendering for prompts.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        if !self.summary.trim().is_empty() {
            out.push_str(self.summary.trim());
            out.push_str("\n\n");
        }
        if !self.models.is_empty() {
            out.push_str("### Data models\n");
            for m in &self.models {
                if m.fields.is_empty() {
                    out.push_str(&format!("- {}\n", m.name));
                } else {
                    out.push_str(&format!("- {}: {}\n", m.name, m.fields.join(", ")));
                }
            }
            out.push('\n');
        }
        if !self.routes.is_empty() {
            out.push_str("### API routes\n");
            for r in &self.routes {
                let method = r.method.to_ascii_uppercase();
                if r.description.is_empty() {
                    out.push_str(&format!("- {} {}\n", method, r.path));
                } else {
                    out.push_str(&format!("- {} {} - {}\n", method, r.path, r.description));
                }
            }
            out.push('\n');
        }
        if !self.components.is_empty() {
            out.push_str("### UI components\n");
            for c in &self.components {
                if c.description.is_empty() {
                    out.push_str(&format!("- {}\n", c.name));
                } else {
                    out.push_str(&format!("- {} - {}\n", c.name, c.description));
                }
            }
        }
        out.trim_end().to_string()
    }
}
