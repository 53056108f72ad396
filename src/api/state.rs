use crate::alerts::AlertLifecycleManager;
use crate::anomaly::AnomalyDetector;
use crate::events::processor::SecurityEventProcessor;
use crate::tenant::TenantScopeEnforcer;

#[derive(Clone)]
pub struct AppState {
    pub enforcer: TenantScopeEnforcer,
    pub processor: SecurityEventProcessor,
    pub detector: AnomalyDetector,
    pub alerts: AlertLifecycleManager,
}
