//! Model negotiation: preferred model first, then fallbacks in order.

use serde::{Deserialize, Serialize};

use crate::core::types::ModelAvailability;

/// The model a job actually runs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub selected_model: String,
    /// Why the preferred model was not used; `None` when it was.
    pub fallback_reason: Option<String>,
}

/// No candidate model was available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoModelAvailable {
    pub tried: Vec<String>,
}

/// Probe `preferred` and then each fallback, returning the first available.
///
/// Duplicate candidates are probed once.
pub fn negotiate<F>(
    preferred: &str,
    fallbacks: &[String],
    mut probe: F,
) -> Result<ModelSelection, NoModelAvailable>
where
    F: FnMut(&str) -> ModelAvailability,
{
    let mut tried: Vec<String> = Vec::new();
    let candidates = std::iter::once(preferred).chain(fallbacks.iter().map(String::as_str));
    for candidate in candidates {
        if candidate.is_empty() || tried.iter().any(|seen| seen == candidate) {
            continue;
        }
        let availability = probe(candidate);
        if availability == ModelAvailability::Available {
            let fallback_reason = (candidate != preferred)
                .then(|| format!("preferred model {preferred} unavailable ({})", tried.join(", ")));
            return Ok(ModelSelection {
                selected_model: candidate.to_string(),
                fallback_reason,
            });
        }
        tried.push(candidate.to_string());
    }
    Err(NoModelAvailable { tried })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallbacks(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_string()).collect()
    }

    #[test]
    fn preferred_available_has_no_fallback_reason() {
        let selection = negotiate("m1", &fallbacks(&["m2"]), |_| ModelAvailability::Available)
            .expect("selection");
        assert_eq!(selection.selected_model, "m1");
        assert_eq!(selection.fallback_reason, None);
    }

    #[test]
    fn falls_back_in_order_and_records_reason() {
        let mut probed = Vec::new();
        let selection = negotiate("m1", &fallbacks(&["m2", "m3"]), |model| {
            probed.push(model.to_string());
            if model == "m3" {
                ModelAvailability::Available
            } else {
                ModelAvailability::Unavailable
            }
        })
        .expect("selection");
        assert_eq!(probed, vec!["m1", "m2", "m3"]);
        assert_eq!(selection.selected_model, "m3");
        let reason = selection.fallback_reason.expect("fallback reason");
        assert!(reason.contains("m1"));
        assert!(reason.contains("m2"));
    }

    #[test]
    fn nothing_available_lists_every_candidate() {
        let err = negotiate("m1", &fallbacks(&["m2", "m1"]), |_| ModelAvailability::Unavailable)
            .expect_err("no model");
        assert_eq!(err.tried, vec!["m1", "m2"]);
    }
}
