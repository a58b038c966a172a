//! Prompt composition.
//!
//! A prompt is an ordered list of [`Section`]s. Each section decides from the
//! [`PromptInputs`] whether it applies and renders its own text; the builder
//! joins the applicable ones. The generation prompt is a base section plus
//! optional addons for template mode, the building-blocks catalog and an
//! injected plan.

mod sections;

use appforge_common::{CapabilityConfig, InputMode};

use crate::capability::ArchitecturePlan;

pub use sections::{fix_user_prompt, planning_system_prompt};

/// Everything a section may look at.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub config: &'a CapabilityConfig,
    pub plan: Option<&'a ArchitecturePlan>,
}

impl<'a> PromptInputs<'a> {
    pub fn new(config: &'a CapabilityConfig) -> Self {
        Self {
            config,
            plan: None,
        }
    }

    pub fn with_plan(mut self, plan: Option<&'a ArchitecturePlan>) -> Self {
        self.plan = plan;
        self
    }

    fn template_mode(&self) -> bool {
        self.config.input_mode == InputMode::Template
    }
}

/// One prompt section provider.
#[derive(Clone, Copy)]
pub struct Section {
    pub key: &'static str,
    applies: fn(&PromptInputs<'_>) -> bool,
    render: fn(&PromptInputs<'_>) -> String,
}

impl Section {
    pub fn new(
        key: &'static str,
        applies: fn(&PromptInputs<'_>) -> bool,
        render: fn(&PromptInputs<'_>) -> String,
    ) -> Self {
        Self { key, applies, render }
    }

    /// A section that always applies.
    pub fn always(key: &'static str, render: fn(&PromptInputs<'_>) -> String) -> Self {
        Self::new(key, |_| true, render)
    }
}

impl std::fmt::Debug for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Section").field("key", &self.key).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    sections: Vec<Section>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    /// Keys of the sections that apply to `inputs`, in order.
    pub fn applied(&self, inputs: &PromptInputs<'_>) -> Vec<&'static str> {
        self.sections
            .iter()
            .filter(|s| (s.applies)(inputs))
            .map(|s| s.key)
            .collect()
    }

    pub fn build(&self, inputs: &PromptInputs<'_>) -> String {
        self.sections
            .iter()
            .filter(|s| (s.applies)(inputs))
            .map(|s| (s.render)(inputs))
            .filter(|text| !text.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// System prompt for the unified code-generation phase.
    pub fn generation() -> Self {
        Self::new()
            .section(Section::always("base", sections::base))
            .section(Section::new("template", |i| i.template_mode(), sections::template_addon))
            .section(Section::new("building_blocks", |i| i.config.building_blocks, sections::building_blocks))
            .section(Section::new("plan", |i| i.plan.is_some_and(|p| !p.is_empty()), sections::plan_addon))
            .section(Section::always("tools", sections::tool_rules))
    }

    /// System prompt for the error-fixing phase.
    pub fn fixing() -> Self {
        Self::new()
            .section(Section::always("fix_base", sections::fix_base))
            .section(Section::new("template", |i| i.template_mode(), sections::template_addon))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::plan::{PlanModel, PlanRoute};

    #[test]
    fn test_naive_generation_has_only_base_sections() {
        let config = CapabilityConfig::default();
        let inputs = PromptInputs::new(&config);
        assert_eq!(PromptBuilder::generation().applied(&inputs), vec!["base", "tools"]);
    }

    #[test]
    fn test_addons_follow_flags_in_order() {
        let config = CapabilityConfig {
            input_mode: InputMode::Template,
            building_blocks: true,
            ..Default::default()
        };
        let plan = ArchitecturePlan {
            summary: "Todo tracker".into(),
            models: vec![PlanModel {
                name: "Todo".into(),
                fields: vec!["title".into()],
            }],
            routes: vec![PlanRoute {
                method: "GET".into(),
                path: "/api/todos".into(),
                description: String::new(),
            }],
            components: vec![],
        };
        let inputs = PromptInputs::new(&config).with_plan(Some(&plan));
        let builder = PromptBuilder::generation();
        assert_eq!(
            builder.applied(&inputs),
            vec!["base", "template", "building_blocks", "plan", "tools"]
        );
        let prompt = builder.build(&inputs);
        assert!(prompt.contains("GET /api/todos"));
        let template_at = prompt.find("starter template").unwrap();
        let plan_at = prompt.find("Todo tracker").unwrap();
        assert!(template_at < plan_at);
    }

    #[test]
    fn test_empty_plan_is_not_injected() {
        let config = CapabilityConfig::default();
        let plan = ArchitecturePlan::default();
        let inputs = PromptInputs::new(&config).with_plan(Some(&plan));
        assert!(!PromptBuilder::generation().applied(&inputs).contains(&"plan"));
    }

    #[test]
    fn test_custom_builder() {
        let config = CapabilityConfig::default();
        let builder = PromptBuilder::new()
            .section(Section::always("a", |_| "first".into()))
            .section(Section::new("b", |_| false, |_| "hidden".into()))
            .section(Section::always("c", |_| "last".into()));
        assert_eq!(builder.build(&PromptInputs::new(&config)), "first\n\nlast");
    }
}
