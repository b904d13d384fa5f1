
use anyhow::Result;
use lightmesh_core::{Device, MeshClient, SessionManager};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Test context passed to all test functions
pub struct TestContext<'a> {
    pub client: &'a MeshClient,
    pub session: &'a SessionManager,
    pub device: &'a Device,
    pub scan_timeout: Duration,
    #[allow(dead_code)]
    pub verbose: bool,
}

impl<'a> TestContext<'a> {
    pub fn new(
        client: &'a MeshClient,
        session: &'a SessionManager,
        device: &'a Device,
        scan_timeout: Duration,
        verbose: bool,
    ) -> Self {
        Self {
            client,
            session,
            device,
            scan_timeout,
            verbose,
        }
    }
}

/// A single test definition
pub struct Test {
    pub name: &'static str,
    #[allow(dead_code)]
    pub description: &'static str,
    pub run_fn: Box<
        dyn for<'a> Fn(&'a mut TestContext<'_>) -> Pin<Box<dyn Future<Output = Result<Value>> + 'a>>
            + Send
            + Sync,
    >,
}

/// Test categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestCategory {
    Discovery,
    Session,
    Control,
}

impl TestCategory {
    pub fn all() -> Vec<Self> {
        vec![Self::Discovery, Self::Session, Self::Control]
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "discovery" | "scan" => Some(Self::Discovery),
            "session" | "connection" => Some(Self::Session),
            "control" | "light" => Some(Self::Control),
            _ => None,
        }
    }

    pub fn get_tests(&self) -> Vec<Test> {
        match self {
            Self::Discovery => discovery::get_tests(),
            Self::Session => session::get_tests(),
            Self::Control => control::get_tests(),
        }
    }
}

/// Helper macro for defining tests
#[macro_export]
macro_rules! define_test {
    ($name:expr, $desc:expr, $func:expr) => {
        Test {
            name: $name,
            description: $desc,
            run_fn: Box::new(move |ctx| Box::pin($func(ctx))),
        }
    };
}
