//! Batch registration of every descriptor file on a datastore.
//!
//! A run connects once, resolves the datastore, enumerates descriptor files and
//! registers them one at a time. A failing file is reported and skipped; only
//! connection and lookup failures abort the run. The session is disconnected
//! on every exit path once it exists.

use crate::config::RegistrarConfig;
use crate::hypervisor::{
    DatastoreRef, DescriptorFile, HypervisorConnector, HypervisorSession, RegisteredVm,
};
use crate::path::correct_path;
use crate::progress::{ProgressUpdate, Reporter};
use crate::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Result of processing one descriptor file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegistrationOutcome {
    Registered(RegisteredVm),
    /// Dry run only: the path that would have been registered.
    Planned { datastore_path: String },
    Failed { message: String },
}

impl RegistrationOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, RegistrationOutcome::Failed { .. })
    }
}

/// Outcome for a single file, in enumeration order.
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub file: DescriptorFile,
    pub outcome: RegistrationOutcome,
}

/// Everything a run did.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationReport {
    pub datastore: String,
    pub target_host: String,
    pub dry_run: bool,
    pub outcomes: Vec<FileOutcome>,
}

impl RegistrationReport {
    fn new(datastore: &DatastoreRef, target_host: &str, dry_run: bool) -> Self {
        Self {
            datastore: datastore.name.clone(),
            target_host: target_host.to_string(),
            dry_run,
            outcomes: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.outcome.is_success())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes.iter().filter(|o| !o.outcome.is_success())
    }
}

/// Registers every descriptor file on one datastore.
pub struct BatchRegistrar<C: HypervisorConnector> {
    connector: C,
    config: RegistrarConfig,
}

impl<C: HypervisorConnector> BatchRegistrar<C> {
    pub fn new(connector: C, config: RegistrarConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    /// Run the whole batch.
    ///
    /// Returns `Err` only for fatal failures (connect, datastore lookup,
    /// enumeration). Per-file failures are part of the returned report.
    pub async fn run(&self, reporter: &mut dyn Reporter) -> Result<RegistrationReport> {
        let config = &self.config;
        info!(
            "Connecting to {} as {}",
            config.endpoint.host(),
            config.credential.username
        );
        let session = self
            .connector
            .connect(&config.endpoint, &config.credential, &config.connect)
            .await?;

        let result = self.run_in_session(&session, reporter).await;

        if let Err(e) = session.disconnect().await {
            warn!(
                "Failed to disconnect from {}: {}",
                config.endpoint.host(),
                e
            );
        }
        result
    }

    async fn run_in_session(
        &self,
        session: &C::Session,
        reporter: &mut dyn Reporter,
    ) -> Result<RegistrationReport> {
        let config = &self.config;
        let datastore = session.find_datastore(&config.datastore).await?;
        let files = session
            .list_descriptor_files(&datastore, &config.extension)
            .await?;

        let target_host = config.target_host();
        let mut report = RegistrationReport::new(&datastore, target_host, config.dry_run);

        if files.is_empty() {
            info!("No descriptor files on {}", datastore.name);
            reporter.report(&ProgressUpdate::NoFiles {
                datastore: &datastore.name,
                extension: &config.extension,
            });
            return Ok(report);
        }

        info!(
            "Found {} descriptor files on {}, registering on {}",
            files.len(),
            datastore.name,
            target_host
        );

        for file in files {
            reporter.report(&ProgressUpdate::Processing { file: &file });
            let outcome = self
                .process_file(session, &datastore, &file, target_host)
                .await;

            match &outcome {
                RegistrationOutcome::Registered(vm) => {
                    reporter.report(&ProgressUpdate::Registered { file: &file, vm })
                }
                RegistrationOutcome::Planned { datastore_path } => {
                    reporter.report(&ProgressUpdate::Planned {
                        file: &file,
                        datastore_path,
                    })
                }
                RegistrationOutcome::Failed { message } => {
                    warn!("Registration failed for {}: {}", file.full_path, message);
                    reporter.report(&ProgressUpdate::Failed {
                        file: &file,
                        error: message,
                    })
                }
            }

            report.outcomes.push(FileOutcome { file, outcome });
        }

        reporter.report(&ProgressUpdate::Finished {
            total: report.total(),
            succeeded: report.succeeded(),
            failed: report.failed(),
            dry_run: report.dry_run,
        });
        Ok(report)
    }

    async fn process_file(
        &self,
        session: &C::Session,
        datastore: &DatastoreRef,
        file: &DescriptorFile,
        target_host: &str,
    ) -> RegistrationOutcome {
        let datastore_path =
            match correct_path(&file.full_path, &datastore.browser_root, &datastore.name) {
                Ok(path) => path,
                Err(e) => {
                    return RegistrationOutcome::Failed {
                        message: e.to_string(),
                    }
                }
            };

        if self.config.dry_run {
            return RegistrationOutcome::Planned { datastore_path };
        }

        debug!("Registering {} on {}", datastore_path, target_host);
        match session
            .register_vm(datastore, &datastore_path, target_host)
            .await
        {
            Ok(vm) => RegistrationOutcome::Registered(vm),
            Err(e) => RegistrationOutcome::Failed {
                message: e.to_string(),
            },
        }
    }
}
