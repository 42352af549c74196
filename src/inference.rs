use serde::{Deserialize, Serialize};

use crate::model::ServiceId;

/// Maps a lowercase keyword found in an event summary to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub keyword: String,
    pub service_id: ServiceId,
}

/// Ordered keyword rules; the first rule whose keyword appears in the
/// summary wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceRules {
    rules: Vec<KeywordRule>,
}

impl ServiceRules {
    pub fn new(rules: impl IntoIterator<Item = (String, ServiceId)>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(keyword, service_id)| KeywordRule {
                    keyword: keyword.to_lowercase(),
                    service_id,
                })
                .collect(),
        }
    }

    pub fn rules(&self) -> &[KeywordRule] {
        &self.rules
    }

    /// Service named by the first matching keyword, if any.
    pub fn infer(&self, summary: &str) -> Option<&str> {
        let summary = summary.to_lowercase();
        self.rules
            .iter()
            .find(|r| !r.keyword.is_empty() && summary.contains(&r.keyword.to_lowercase()))
            .map(|r| r.service_id.as_str())
    }

    /// Like `infer`, but never fails: falls back to `default_service`.
    pub fn infer_or<'a>(&'a self, summary: Option<&str>, default_service: &'a str) -> &'a str {
        summary
            .and_then(|s| self.infer(s))
            .unwrap_or(default_service)
    }
}

impl Default for ServiceRules {
    /// Colouring first: "corte y tinte" is booked as the longer service.
    fn default() -> Self {
        Self::new(
            [("tinte", "tinte"), ("barba", "barba"), ("corte", "corte")]
                .map(|(k, s)| (k.to_string(), s.to_string())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_rule_wins() {
        let rules = ServiceRules::default();
        assert_eq!(rules.infer("Corte y tinte - Laura"), Some("tinte"));
        assert_eq!(rules.infer("corte + barba"), Some("barba"));
        assert_eq!(rules.infer("Corte"), Some("corte"));
    }

    #[test]
    fn matching_ignores_case() {
        let rules = ServiceRules::new([("MECHAS".to_string(), "tinte".to_string())]);
        assert_eq!(rules.infer("mechas rubias"), Some("tinte"));
    }

    #[test]
    fn falls_back_to_default() {
        let rules = ServiceRules::default();
        assert_eq!(rules.infer("Reunión proveedores"), None);
        assert_eq!(rules.infer_or(Some("Reunión"), "corte"), "corte");
        assert_eq!(rules.infer_or(None, "barba"), "barba");
    }

    #[test]
    fn deserializes_from_list() {
        let rules: ServiceRules =
            serde_json::from_str(r#"[{"keyword": "peinado", "service_id": "corte"}]"#).unwrap();
        assert_eq!(rules.infer("Peinado novia"), Some("corte"));
    }
}
