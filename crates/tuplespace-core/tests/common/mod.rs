//! Shared fixtures for the integration tests.
//!
//! Set `RUST_LOG=tuplespace_core=debug` to see engine logs.

use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tuplespace_core::{
    Engine, EngineConfig, EnvId, EnvironmentDescriptor, LocalLeaseService, Manager, ProtectionId,
    ResourceDescriptor, Tuple,
};

/// Route engine logs to the test harness once per binary.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start an engine over `root` with an in-process lease service.
pub fn engine_at(root: &Path) -> (Engine, LocalLeaseService) {
    init_tracing();
    let leases = LocalLeaseService::new();
    let engine = Engine::startup(EngineConfig::with_data_root(root), Arc::new(leases.clone()))
        .expect("engine startup");
    (engine, leases)
}

pub fn protection() -> ProtectionId {
    ProtectionId::from_u128(0xfeed)
}

/// Create the root environment.
pub fn create_root(engine: &Engine, name: &str) -> EnvId {
    let id = EnvId::new_v4();
    engine
        .create(&EnvironmentDescriptor::root(id, name, protection()))
        .expect("create root");
    id
}

/// Create a child environment of `parent`.
pub fn create_child(engine: &Engine, parent: EnvId, name: &str) -> EnvId {
    let id = EnvId::new_v4();
    engine
        .create(&EnvironmentDescriptor::child(id, name, parent, protection()))
        .expect("create child");
    id
}

pub fn bind(engine: &Engine, env: EnvId, holder: &str) -> Manager {
    engine
        .bind(&ResourceDescriptor::storage(env), holder, None)
        .expect("bind")
}

pub fn row(n: i64) -> Tuple {
    Tuple::builder("Row").field("n", n).field("label", format!("row-{n}")).build()
}

/// Every tuple of `env`, sorted by id.
pub fn contents(engine: &Engine, env: EnvId) -> Vec<Tuple> {
    let manager = bind(engine, env, "inspector");
    let iterator = manager.query(&tuplespace_core::Query::Empty).expect("query");
    let mut tuples = Vec::new();
    while let Ok(hit) = manager.next(iterator) {
        tuples.push(hit.into_tuple().expect("full tuple"));
    }
    manager.revoke();
    tuples.sort_by_key(Tuple::id);
    tuples
}
