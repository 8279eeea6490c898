use crate::config::Settings;
use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub host_url: String,
    pub registry: SessionRegistry,
}
