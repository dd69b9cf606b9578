//! In-process daemon harness shared by the integration tests.
//!
//! Assembles the real stack through the daemon's own bootstrap — store,
//! router, event log, services, transport over a real Unix socket in a
//! temp dir — with the scriptable mock provider injected so tests
//! control every completion outcome.

use std::collections::HashMap;
use std::sync::Arc;

use ksi_config::DaemonConfig;
use ksi_daemon::bootstrap::{self, DaemonHandles};
use ksi_provider::{MockDriver, ProviderDriver};
use ksi_transport::TransportClient;
use tempfile::TempDir;

/// A fully wired in-process daemon.
pub struct TestDaemon {
    /// Live handles from the daemon bootstrap.
    pub handles: DaemonHandles,
    /// The scriptable provider behind every completion.
    pub mock: Arc<MockDriver>,
    tempdir: Option<TempDir>,
}

impl TestDaemon {
    /// Start a daemon in a fresh temp dir with the given composition
    /// files written into its content tree.
    ///
    /// # Panics
    ///
    /// Panics on any wiring failure; tests want a loud start.
    pub async fn start(compositions: &[(&str, &str)]) -> Self {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let config = DaemonConfig::scoped_to(tempdir.path());
        Self::start_with(config, compositions, Some(tempdir)).await
    }

    /// Start against an explicit config (for restart tests re-using a
    /// root directory).
    ///
    /// # Panics
    ///
    /// Panics on any wiring failure.
    pub async fn start_with(
        config: DaemonConfig,
        compositions: &[(&str, &str)],
        tempdir: Option<TempDir>,
    ) -> Self {
        std::fs::create_dir_all(&config.composition.content_root).expect("content root");
        for (name, content) in compositions {
            std::fs::write(config.composition.content_root.join(name), content)
                .expect("composition file");
        }

        let mock = Arc::new(MockDriver::new());
        let mut drivers: HashMap<String, Arc<dyn ProviderDriver>> = HashMap::new();
        drivers.insert("mock".to_owned(), Arc::clone(&mock) as Arc<dyn ProviderDriver>);

        let handles = bootstrap::assemble(config, drivers).await.expect("assemble");
        Self {
            handles,
            mock,
            tempdir,
        }
    }

    /// Connect a client to this daemon's socket.
    ///
    /// # Panics
    ///
    /// Panics if the socket is not accepting.
    pub async fn client(&self) -> TransportClient {
        TransportClient::connect(&self.handles.config.transport.socket_path)
            .await
            .expect("client connect")
    }

    /// Give up the temp dir (restart tests keep the root alive across
    /// daemon instances).
    pub fn take_tempdir(&mut self) -> Option<TempDir> {
        self.tempdir.take()
    }
}

/// A minimal echo profile most tests spawn agents from.
pub const ECHO_PROFILE: (&str, &str) = (
    "echo.yaml",
    "name: echo\nversion: 1.0.0\ncomponent_type: profile\nmodel: m\nprompt: You echo.\n",
);
