use chrono::{DateTime, Utc};
use lightmesh_core::connection::SessionStats;
use serde::{Deserialize, Serialize};

/// Result of a single test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub category: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Summary statistics for a test category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryStats {
    pub category: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// The fixture under test
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureInfo {
    pub transport_id: String,
    pub name: Option<String>,
    pub mesh_address: u16,
    pub rssi: Option<i16>,
    pub mesh: Option<String>,
}

/// Link health over the whole run, taken from the session counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkQuality {
    pub frames_sent: u64,
    pub acks_received: u64,
    pub failures: u64,
    pub write_retries: u64,
    pub handshakes: u64,
    pub error_rate: f64,
    pub stability: String, // "Excellent", "Good", "Fair", "Poor"
}

impl Default for LinkQuality {
    fn default() -> Self {
        Self {
            frames_sent: 0,
            acks_received: 0,
            failures: 0,
            write_retries: 0,
            handshakes: 0,
            error_rate: 0.0,
            stability: "Unknown".to_string(),
        }
    }
}

/// Complete test report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub test_id: String,
    pub timestamp: DateTime<Utc>,
    pub fixture: FixtureInfo,
    pub link_quality: LinkQuality,
    pub tests_run: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub duration_ms: u64,
    pub test_results: Vec<TestResult>,
    pub category_stats: Vec<CategoryStats>,
    pub recommendations: Vec<String>,
}

impl TestReport {
    pub fn new(fixture: FixtureInfo) -> Self {
        Self {
            test_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            fixture,
            link_quality: LinkQuality::default(),
            tests_run: 0,
            tests_passed: 0,
            tests_failed: 0,
            duration_ms: 0,
            test_results: Vec::new(),
            category_stats: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn add_test_result(&mut self, result: TestResult) {
        self.tests_run += 1;
        if result.passed {
            self.tests_passed += 1;
        } else {
            self.tests_failed += 1;
        }
        self.test_results.push(result);
    }

    pub fn record_link(&mut self, stats: &SessionStats) {
        let quality = &mut self.link_quality;
        quality.frames_sent = stats.frames_sent;
        quality.acks_received = stats.acks_received;
        quality.failures = stats.failures;
        quality.write_retries = stats.write_retries;
        quality.handshakes = stats.handshakes;
    }

    pub fn calculate_stats(&mut self) {
        let mut category_map: std::collections::BTreeMap<String, CategoryStats> =
            std::collections::BTreeMap::new();

        for result in &self.test_results {
            let stat = category_map
                .entry(result.category.clone())
                .or_insert_with(|| CategoryStats {
                    category: result.category.clone(),
                    total: 0,
                    passed: 0,
                    failed: 0,
                    duration_ms: 0,
                });

            stat.total += 1;
            stat.duration_ms += result.duration_ms;

            if result.passed {
                stat.passed += 1;
            } else {
                stat.failed += 1;
            }
        }

        self.category_stats = category_map.into_values().collect();

        let quality = &mut self.link_quality;
        let attempts = quality.frames_sent + quality.write_retries;
        if attempts > 0 {
            quality.error_rate = (quality.failures + quality.write_retries) as f64 / attempts as f64;

            quality.stability = match quality.error_rate {
                r if r < 0.01 => "Excellent",
                r if r < 0.05 => "Good",
                r if r < 0.10 => "Fair",
                _ => "Poor",
            }
            .to_string();
        }

        self.generate_recommendations();
    }

    fn generate_recommendations(&mut self) {
        self.recommendations.clear();

        if self.link_quality.error_rate > 0.05 {
            self.recommendations.push(
                "High link error rate detected. Move closer to the fixture or reduce interference."
                    .to_string(),
            );
        }

        if self.link_quality.handshakes > 1 {
            self.recommendations.push(format!(
                "Session logged in {} times. The fixture dropped the session during the run.",
                self.link_quality.handshakes
            ));
        }

        if self.tests_failed > self.tests_passed {
            self.recommendations.push(
                "Majority of tests failed. Check the mesh credentials or power-cycle the fixture."
                    .to_string(),
            );
        }

        for stat in &self.category_stats {
            if stat.failed > stat.passed {
                self.recommendations.push(format!(
                    "{category} tests are failing. Focus on debugging this area.",
                    category = stat.category
                ));
            }
        }
    }

    pub fn print_summary(&self) {
        use colored::*;

        println!(
            "\n{separator}",
            separator = "═══════════════════════════════════════════════════════".bold()
        );
        println!(
            "{title}",
            title = "                   TEST REPORT SUMMARY                  "
                .bold()
                .cyan()
        );
        println!(
            "{separator}",
            separator = "═══════════════════════════════════════════════════════".bold()
        );

        println!("\n{section}", section = "Fixture:".bold());
        println!("  Address: {id}", id = self.fixture.transport_id);
        if let Some(name) = &self.fixture.name {
            println!("  Name: {name}");
        }
        println!("  Mesh address: {addr:#06x}", addr = self.fixture.mesh_address);
        if let Some(mesh) = &self.fixture.mesh {
            println!("  Mesh: {mesh}");
        }

        println!("\n{section}", section = "Test Results:".bold());
        println!("  Total Tests: {total}", total = self.tests_run);
        println!(
            "  Passed: {passed} {percentage}",
            passed = self.tests_passed,
            percentage = format!(
                "({percent}%)",
                percent = self.tests_passed * 100 / self.tests_run.max(1)
            )
            .green()
        );
        println!(
            "  Failed: {failed} {percentage}",
            failed = self.tests_failed,
            percentage = if self.tests_failed > 0 {
                format!(
                    "({percent}%)",
                    percent = self.tests_failed * 100 / self.tests_run.max(1)
                )
                .red()
            } else {
                "".normal()
            }
        );

        let quality = &self.link_quality;
        println!("\n{section}", section = "Link Quality:".bold());
        println!(
            "  Frames: {sent} sent, {acks} acknowledged",
            sent = quality.frames_sent,
            acks = quality.acks_received
        );
        println!(
            "  Success Rate: {rate:.1}%",
            rate = (1.0 - quality.error_rate) * 100.0
        );
        println!(
            "  Stability: {stability}",
            stability = match quality.stability.as_str() {
                "Excellent" | "Good" => quality.stability.green(),
                "Fair" => quality.stability.yellow(),
                "Poor" => quality.stability.red(),
                _ => quality.stability.normal(),
            }
        );

        if !self.recommendations.is_empty() {
            println!("\n{section}", section = "Recommendations:".bold().yellow());
            for rec in &self.recommendations {
                println!("  • {rec}");
            }
        }

        println!(
            "\n{}",
            "═══════════════════════════════════════════════════════".bold()
        );
    }

    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        md.push_str("# Mesh Light Test Report\n\n");
        md.push_str(&format!("**Test ID:** {id}\n", id = self.test_id));
        md.push_str(&format!("**Date:** {timestamp}\n", timestamp = self.timestamp));
        md.push_str(&format!(
            "**Fixture:** {name} ({id})\n\n",
            name = self.fixture.name.as_deref().unwrap_or("Unknown"),
            id = self.fixture.transport_id
        ));

        md.push_str("## Summary\n\n");
        md.push_str(&format!("- **Total Tests:** {total}\n", total = self.tests_run));
        md.push_str(&format!(
            "- **Passed:** {passed} ({percentage:.1}%)\n",
            passed = self.tests_passed,
            percentage = self.tests_passed as f64 / self.tests_run.max(1) as f64 * 100.0
        ));
        md.push_str(&format!(
            "- **Failed:** {failed} ({percentage:.1}%)\n",
            failed = self.tests_failed,
            percentage = self.tests_failed as f64 / self.tests_run.max(1) as f64 * 100.0
        ));
        md.push_str(&format!(
            "- **Link stability:** {stability}\n",
            stability = self.link_quality.stability
        ));
        md.push('\n');

        md.push_str("## Test Results\n\n");
        md.push_str("| Category | Test | Result | Duration | Details |\n");
        md.push_str("|----------|------|--------|----------|----------|\n");

        for result in &self.test_results {
            let status = if result.passed { "✅ Pass" } else { "❌ Fail" };
            let details = result.error.clone().unwrap_or_else(|| "OK".to_string());

            md.push_str(&format!(
                "| {category} | {name} | {status} | {duration}ms | {details} |\n",
                category = result.category,
                name = result.name,
                duration = result.duration_ms,
            ));
        }

        md.push_str("\n## Recommendations\n\n");
        for rec in &self.recommendations {
            md.push_str(&format!("- {rec}\n"));
        }

        md
    }
}
