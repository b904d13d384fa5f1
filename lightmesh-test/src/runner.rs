use anyhow::{Context, Result};
use chrono::Utc;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use lightmesh_core::{Device, MeshClient, SessionManager};
use std::time::{Duration, Instant};

use crate::report::{FixtureInfo, TestReport, TestResult};
use crate::tests::{TestCategory, TestContext};

pub struct TestRunner {
    client: MeshClient,
    session: SessionManager,
    device: Device,
    scan_timeout: Duration,
    report: TestReport,
    verbose: bool,
    non_interactive: bool,
    categories: Vec<TestCategory>,
    progress: Option<ProgressBar>,
}

impl TestRunner {
    pub async fn new(
        client: MeshClient,
        selector: Option<&str>,
        scan_timeout: Duration,
        verbose: bool,
        non_interactive: bool,
    ) -> Result<Self> {
        eprintln!(
            "{arrow} Scanning for fixtures ({window})...",
            arrow = "→".cyan(),
            window = humantime::format_duration(scan_timeout)
        );

        let devices = client.scan(scan_timeout).await?;
        let device = select_device(devices, selector)?;

        eprintln!(
            "{arrow} Connecting to {name} ({id})...",
            arrow = "→".cyan(),
            name = device.display_name().bold(),
            id = device.transport_id
        );

        let session = client
            .connect(&device)
            .await
            .with_context(|| format!("Failed to connect to {}", device.transport_id))?;

        let mesh = session.identity().await.map(|identity| identity.to_string());
        eprintln!(
            "{check} Logged in to mesh {mesh}",
            check = "✓".green(),
            mesh = mesh.as_deref().unwrap_or("?").bold()
        );

        let fixture = FixtureInfo {
            transport_id: device.transport_id.to_string(),
            name: device.name.clone(),
            mesh_address: device.mesh_address,
            rssi: device.rssi,
            mesh,
        };

        Ok(Self {
            client,
            session,
            device,
            scan_timeout,
            report: TestReport::new(fixture),
            verbose,
            non_interactive,
            categories: TestCategory::all(),
            progress: None,
        })
    }

    pub async fn run_all_tests(&mut self) -> Result<TestReport> {
        let start_time = Instant::now();

        eprintln!(
            "\n{message}",
            message = "Starting fixture tests...".bold().cyan()
        );

        if !self.non_interactive {
            let total_tests = self.estimate_total_tests();
            self.progress = Some(ProgressBar::new(total_tests as u64));
            if let Some(pb) = &self.progress {
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("#>-"),
                );
            }
        } else if self.verbose {
            eprintln!(
                "{arrow} Running {total} tests across {categories} categories",
                arrow = "→".blue(),
                total = self.estimate_total_tests(),
                categories = self.categories.len()
            );
        }

        for category in self.categories.clone() {
            self.run_category_tests(category).await;
        }

        self.report.duration_ms = start_time.elapsed().as_millis() as u64;
        self.report.record_link(&self.session.stats().await);
        self.report.calculate_stats();

        if let Some(pb) = &self.progress {
            pb.finish_and_clear();
        }

        if let Err(e) = self.client.disconnect(&self.session).await {
            eprintln!("{warn} Disconnect failed: {e}", warn = "⚠".yellow());
        }

        Ok(self.report.clone())
    }

    async fn run_category_tests(&mut self, category: TestCategory) {
        let category_name = format!("{category:?}");

        if self.verbose || self.non_interactive {
            eprintln!(
                "\n{arrow} Running {category} tests...",
                arrow = "→".blue(),
                category = category_name.bold()
            );
        }

        for test in category.get_tests() {
            let test_start = Instant::now();

            if let Some(pb) = &self.progress {
                pb.set_message(format!("{category_name}: {name}", name = test.name));
            } else if self.non_interactive && self.verbose {
                eprintln!(
                    "  {arrow} Testing: {name}",
                    arrow = "→".cyan(),
                    name = test.name
                );
            }

            let mut context = TestContext::new(
                &self.client,
                &self.session,
                &self.device,
                self.scan_timeout,
                self.verbose,
            );
            let (passed, details, error) = match (test.run_fn)(&mut context).await {
                Ok(details) => (true, details, None),
                Err(e) => {
                    let error_msg = format!("{e:#}");
                    (
                        false,
                        serde_json::json!({"error": &error_msg}),
                        Some(error_msg),
                    )
                }
            };

            let result = TestResult {
                name: test.name.to_string(),
                category: category_name.clone(),
                passed,
                duration_ms: test_start.elapsed().as_millis() as u64,
                error,
                details,
                timestamp: Utc::now(),
            };

            if self.verbose || self.non_interactive {
                match &result.error {
                    None => eprintln!(
                        "  {check} {name} ({duration}ms)",
                        check = "✓".green(),
                        name = test.name,
                        duration = result.duration_ms
                    ),
                    Some(error) => eprintln!(
                        "  {cross} {name} - {error} ({duration}ms)",
                        cross = "✗".red(),
                        name = test.name,
                        error = error.red(),
                        duration = result.duration_ms
                    ),
                }
            }

            self.report.add_test_result(result);

            if let Some(pb) = &self.progress {
                pb.inc(1);
            }
        }
    }

    fn estimate_total_tests(&self) -> usize {
        self.categories.iter().map(|c| c.get_tests().len()).sum()
    }

    pub async fn run_specific_tests(&mut self, categories: Vec<String>) -> Result<TestReport> {
        self.categories = categories
            .iter()
            .filter_map(|name| TestCategory::from_str(name))
            .collect();

        if self.categories.is_empty() {
            anyhow::bail!("No valid test categories specified");
        }

        self.run_all_tests().await
    }
}

/// Exact address match first, then a case-insensitive name match, else the
/// strongest fixture
fn select_device(devices: Vec<Device>, selector: Option<&str>) -> Result<Device> {
    let Some(selector) = selector else {
        return devices
            .into_iter()
            .next()
            .context("No mesh fixtures found. Is the light powered and in range?");
    };

    let needle = selector.to_lowercase();
    let by_address = devices
        .iter()
        .position(|d| d.transport_id.as_str().eq_ignore_ascii_case(selector));
    let by_name = || {
        devices.iter().position(|d| {
            d.name
                .as_deref()
                .is_some_and(|name| name.to_lowercase().contains(&needle))
        })
    };

    by_address
        .or_else(by_name)
        .map(|index| devices[index].clone())
        .with_context(|| format!("No fixture matching '{selector}' found"))
}
