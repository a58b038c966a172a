use appforge_common::{CapabilityConfig, InputMode};

/// One phase of the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Template,
    Planning,
    CodeGeneration,
    Validation,
    ErrorFixing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Planning => "planning",
            Self::CodeGeneration => "codeGeneration",
            Self::Validation => "validation",
            Self::ErrorFixing => "errorFixing",
        }
    }
}

/// Stages the configuration asks for, in execution order. `ErrorFixing`
/// stands for the whole fix loop, which re-runs `Validation` after each fix.
pub fn stage_sequence(config: &CapabilityConfig) -> Vec<Stage> {
    let mut stages = Vec::with_capacity(5);
    if config.input_mode == InputMode::Template {
        stages.push(Stage::Template);
    }
    if config.planning {
        stages.push(Stage::Planning);
    }
    stages.push(Stage::CodeGeneration);
    if config.compiler_checks {
        stages.push(Stage::Validation);
        stages.push(Stage::ErrorFixing);
    }
    stages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_for_every_flag_combination() {
        for mode in [InputMode::Naive, InputMode::Template] {
            for planning in [false, true] {
                for compiler_checks in [false, true] {
                    let config = CapabilityConfig {
                        input_mode: mode,
                        planning,
                        compiler_checks,
                        ..Default::default()
                    };
                    let stages = stage_sequence(&config);
                    assert_eq!(stages.contains(&Stage::Template), mode == InputMode::Template);
                    assert_eq!(stages.contains(&Stage::Planning), planning);
                    assert_eq!(stages.contains(&Stage::Validation), compiler_checks);
                    assert_eq!(stages.contains(&Stage::ErrorFixing), compiler_checks);
                    assert!(stages.contains(&Stage::CodeGeneration));
                }
            }
        }
    }

    #[test]
    fn test_full_sequence_order() {
        let config = CapabilityConfig {
            input_mode: InputMode::Template,
            planning: true,
            compiler_checks: true,
            ..Default::default()
        };
        assert_eq!(
            stage_sequence(&config),
            vec![
                Stage::Template,
                Stage::Planning,
                Stage::CodeGeneration,
                Stage::Validation,
                Stage::ErrorFixing,
            ]
        );
    }

    #[test]
    fn test_minimal_sequence() {
        assert_eq!(stage_sequence(&CapabilityConfig::default()), vec![Stage::CodeGeneration]);
    }
}
