use dl_config::SpecialistConfig;
use serde::Serialize;

/// A named preset system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Specialist {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub prompt: String,
}

impl From<SpecialistConfig> for Specialist {
    fn from(config: SpecialistConfig) -> Self {
        Self {
            id: config.id,
            name: config.name,
            description: config.description,
            prompt: config.prompt,
        }
    }
}

pub trait SpecialistCatalog: Send + Sync {
    fn list(&self) -> Vec<Specialist>;

    fn get(&self, id: &str) -> Option<Specialist> {
        self.list().into_iter().find(|s| s.id == id)
    }
}

/// Catalog built from the `[[specialists]]` tables of the daemon config.
#[derive(Debug, Clone, Default)]
pub struct ConfigSpecialists {
    specialists: Vec<Specialist>,
}

impl ConfigSpecialists {
    pub fn new(configs: impl IntoIterator<Item = SpecialistConfig>) -> Self {
        Self {
            specialists: configs.into_iter().map(Specialist::from).collect(),
        }
    }
}

impl SpecialistCatalog for ConfigSpecialists {
    fn list(&self) -> Vec<Specialist> {
        self.specialists.clone()
    }
}
