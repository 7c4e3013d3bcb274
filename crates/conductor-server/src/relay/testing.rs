//! Test fixtures shared by the relay tests.

use super::context::RelayContext;
use super::registry::ConnectionRegistry;
use super::supervisor::{ReconnectPolicy, ReconnectSupervisor};
use crate::auth::AuthGate;
use crate::host::{HostDebugger, InjectError};
use conductor_core::PayloadTemplate;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A host that is never reachable.
pub(crate) struct RefusingHost;

impl HostDebugger for RefusingHost {
    fn inject<'a>(
        &'a self,
        _payload: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), InjectError>> + Send + 'a>> {
        Box::pin(async { Err(InjectError::Refused("connection refused".into())) })
    }
}

/// Context whose upstream must present `secret`, accepting `client_secrets`.
pub(crate) fn context(secret: &str, client_secrets: &[&str]) -> Arc<RelayContext> {
    let supervisor = ReconnectSupervisor::new(
        Arc::new(RefusingHost),
        PayloadTemplate::new("init:$SECRET").expect("template"),
        7355,
        ReconnectPolicy::default(),
    );
    RelayContext::new(
        ConnectionRegistry::new(secret.to_string()),
        AuthGate::new(client_secrets.iter().map(|s| s.to_string())),
        supervisor,
    )
}
