use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{NaiveDate, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::engine::{EngineError, EntityKind};
use crate::model::{ImportScope, ProfessionalId, ServiceId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub duration_min: u32,
    pub price_cents: u32,
}

impl Service {
    pub fn duration(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.duration_min))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Professional {
    pub id: ProfessionalId,
    pub name: String,
    pub services: BTreeSet<ServiceId>,
}

impl Professional {
    pub fn can_perform(&self, service_id: &str) -> bool {
        self.services.contains(service_id)
    }
}

/// Static services and professionals, loaded once at startup.
///
/// Professionals keep their configured order; auto-assignment walks them in
/// that order.
#[derive(Debug, Clone)]
pub struct Catalog {
    services: Vec<Service>,
    professionals: Vec<Professional>,
    service_index: HashMap<ServiceId, usize>,
    professional_index: HashMap<ProfessionalId, usize>,
    /// Professional → external calendar id.
    calendars: BTreeMap<ProfessionalId, String>,
}

impl Catalog {
    pub fn new(services: Vec<Service>, professionals: Vec<Professional>) -> Result<Self, ConfigError> {
        let mut service_index = HashMap::with_capacity(services.len());
        for (i, s) in services.iter().enumerate() {
            if s.duration_min == 0 {
                return Err(ConfigError::InvalidCatalog(format!(
                    "service {} has zero duration",
                    s.id
                )));
            }
            if service_index.insert(s.id.clone(), i).is_some() {
                return Err(ConfigError::InvalidCatalog(format!("duplicate service {}", s.id)));
            }
        }

        let mut professional_index = HashMap::with_capacity(professionals.len());
        for (i, p) in professionals.iter().enumerate() {
            if let Some(unknown) = p.services.iter().find(|s| !service_index.contains_key(*s)) {
                return Err(ConfigError::InvalidCatalog(format!(
                    "professional {} offers unknown service {unknown}",
                    p.id
                )));
            }
            if professional_index.insert(p.id.clone(), i).is_some() {
                return Err(ConfigError::InvalidCatalog(format!(
                    "duplicate professional {}",
                    p.id
                )));
            }
        }

        Ok(Self {
            services,
            professionals,
            service_index,
            professional_index,
            calendars: BTreeMap::new(),
        })
    }

    /// Map a professional to the external calendar holding their events.
    pub fn with_calendar(
        mut self,
        professional_id: &str,
        calendar_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        if !self.professional_index.contains_key(professional_id) {
            return Err(ConfigError::InvalidCatalog(format!(
                "calendar mapped to unknown professional {professional_id}"
            )));
        }
        self.calendars
            .insert(professional_id.to_string(), calendar_id.into());
        Ok(self)
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn professionals(&self) -> &[Professional] {
        &self.professionals
    }

    pub fn service(&self, id: &str) -> Option<&Service> {
        self.service_index.get(id).map(|&i| &self.services[i])
    }

    pub fn professional(&self, id: &str) -> Option<&Professional> {
        self.professional_index.get(id).map(|&i| &self.professionals[i])
    }

    /// Professionals able to perform `service_id`, in catalog order.
    pub fn authorized_for<'a>(&'a self, service_id: &'a str) -> impl Iterator<Item = &'a Professional> {
        self.professionals
            .iter()
            .filter(move |p| p.can_perform(service_id))
    }

    pub fn require_service(&self, service_id: &str) -> Result<&Service, EngineError> {
        self.service(service_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Service, service_id))
    }

    /// Resolve a (service, professional) pair, failing unless the professional
    /// offers the service.
    pub fn authorize(
        &self,
        service_id: &str,
        professional_id: &str,
    ) -> Result<(&Service, &Professional), EngineError> {
        let service = self.require_service(service_id)?;
        let professional = self
            .professional(professional_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Professional, professional_id))?;
        if !professional.can_perform(service_id) {
            return Err(EngineError::Unauthorized {
                professional_id: professional_id.to_string(),
                service_id: service_id.to_string(),
            });
        }
        Ok((service, professional))
    }

    pub fn calendar_for(&self, professional_id: &str) -> Option<&str> {
        self.calendars.get(professional_id).map(String::as_str)
    }

    /// One import scope per mapped calendar, each tied to its professional.
    pub fn calendar_scopes(&self, start_date: NaiveDate, end_date: NaiveDate) -> Vec<ImportScope> {
        self.calendars
            .iter()
            .map(|(professional_id, calendar_id)| ImportScope {
                calendar_id: calendar_id.clone(),
                professional_id: Some(professional_id.clone()),
                start_date,
                end_date,
            })
            .collect()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        let service = |id: &str, name: &str, duration_min, price_cents| Service {
            id: id.into(),
            name: name.into(),
            duration_min,
            price_cents,
        };
        let professional = |id: &str, name: &str, services: &[&str]| Professional {
            id: id.into(),
            name: name.into(),
            services: services.iter().map(|s| s.to_string()).collect(),
        };
        Catalog::new(
            vec![
                service("corte", "Corte", 30, 1500),
                service("barba", "Barba", 20, 1000),
                service("tinte", "Tinte", 90, 4500),
            ],
            vec![
                professional("ana", "Ana", &["corte", "tinte"]),
                professional("luis", "Luis", &["corte", "barba"]),
                professional("marta", "Marta", &["corte", "barba", "tinte"]),
            ],
        )
        .expect("built-in catalog is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_lookup() {
        let catalog = Catalog::default();
        assert_eq!(catalog.service("corte").unwrap().duration(), TimeDelta::minutes(30));
        assert!(catalog.professional("ana").unwrap().can_perform("tinte"));
        assert!(!catalog.professional("luis").unwrap().can_perform("tinte"));
    }

    #[test]
    fn authorized_for_keeps_catalog_order() {
        let catalog = Catalog::default();
        let ids: Vec<_> = catalog.authorized_for("barba").map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["luis", "marta"]);
    }

    #[test]
    fn authorize_distinguishes_unknown_and_unauthorized() {
        let catalog = Catalog::default();
        assert!(matches!(
            catalog.authorize("permanente", "ana"),
            Err(EngineError::NotFound { kind: EntityKind::Service, .. })
        ));
        assert!(matches!(
            catalog.authorize("corte", "pedro"),
            Err(EngineError::NotFound { kind: EntityKind::Professional, .. })
        ));
        assert!(matches!(
            catalog.authorize("barba", "ana"),
            Err(EngineError::Unauthorized { .. })
        ));
        assert!(catalog.authorize("corte", "ana").is_ok());
    }

    #[test]
    fn rejects_professional_with_unknown_service() {
        let result = Catalog::new(
            vec![],
            vec![Professional {
                id: "ana".into(),
                name: "Ana".into(),
                services: ["corte".to_string()].into(),
            }],
        );
        assert!(matches!(result, Err(ConfigError::InvalidCatalog(_))));
    }

    #[test]
    fn rejects_zero_duration_service() {
        let result = Catalog::new(
            vec![Service {
                id: "x".into(),
                name: "X".into(),
                duration_min: 0,
                price_cents: 0,
            }],
            vec![],
        );
        assert!(result.is_err());
    }

    #[test]
    fn calendar_scopes_follow_mapping() {
        let catalog = Catalog::default()
            .with_calendar("ana", "cal-ana")
            .unwrap()
            .with_calendar("luis", "cal-luis")
            .unwrap();
        let day = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        let scopes = catalog.calendar_scopes(day, day);
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[0].calendar_id, "cal-ana");
        assert_eq!(scopes[0].professional_id.as_deref(), Some("ana"));
        assert!(Catalog::default().with_calendar("nadie", "cal").is_err());
    }
}
