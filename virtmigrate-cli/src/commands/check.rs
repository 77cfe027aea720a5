//! Check Command
//!
//! Runs the feasibility probes and prints one row per probe.

use anyhow::{bail, Result};
use console::style;

use virtmigrate_core::MigrationConfig;
use virtmigrate_engine::{CheckEngine, CheckReport, ProbeStatus, TemplateRenderer};

use super::connect_clusters;
use crate::symbols;

const TABLE_WIDTH: usize = 60;
const NAME_WIDTH: usize = 30;

/// Run check command
pub async fn run(config: MigrationConfig) -> Result<()> {
    let (source, destination) = connect_clusters(&config);
    let renderer = TemplateRenderer::new(config.templates_dir.clone());

    let report = CheckEngine::new(source, destination, renderer)
        .run(&config)
        .await;

    print!("{}", render_table(&report));

    if report.error.is_some() {
        bail!("connectivity check failed");
    }
    if !report.success() {
        let failed = report
            .results
            .iter()
            .filter(|(_, status)| *status == ProbeStatus::Failed)
            .count();
        bail!("{} check(s) failed", failed);
    }

    println!(
        "{} All validation checks passed",
        style(symbols::CHECK).green()
    );
    Ok(())
}

/// Results table, in probe order, followed by the error when the run stopped early.
pub fn render_table(report: &CheckReport) -> String {
    let rule = symbols::RULE.to_string().repeat(TABLE_WIDTH);
    let mut out = String::new();

    out.push('\n');
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format!(
        "{} {}\n",
        symbols::LOOKING_GLASS,
        style("CONNECTIVITY CHECK RESULTS SUMMARY").bold()
    ));
    out.push_str(&rule);
    out.push('\n');

    for (probe, status) in report.results.iter() {
        let (symbol, label) = match status {
            ProbeStatus::Success => (
                style(symbols::CHECK).green(),
                style(status.label()).green(),
            ),
            ProbeStatus::Failed => (style(symbols::CROSS).red(), style(status.label()).red()),
            ProbeStatus::NotTested => (
                style(symbols::QUESTION).yellow(),
                style(status.label()).yellow(),
            ),
        };
        let name = format!("{}:", probe.name());
        out.push_str(&format!("{:<width$} {}  {}\n", name, symbol, label, width = NAME_WIDTH));
    }

    out.push_str(&rule);
    out.push_str("\n\n");

    if let Some(error) = &report.error {
        out.push_str(&format!(
            "{} Error details: {}\n\n",
            style(symbols::WARN).red(),
            error
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtmigrate_core::MigrateError;
    use virtmigrate_engine::{CheckResults, Probe};

    fn report(error: Option<MigrateError>) -> CheckReport {
        let mut results = CheckResults::default();
        results.record(Probe::SourceVm, ProbeStatus::Success);
        results.record(Probe::DestinationVm, ProbeStatus::Failed);
        results.mark_remaining_not_tested();
        CheckReport { results, error }
    }

    #[test]
    fn test_table_lists_every_probe_in_order() {
        let table = render_table(&report(None));

        assert!(table.contains("CONNECTIVITY CHECK RESULTS SUMMARY"));
        assert!(table.contains(&"=".repeat(60)));

        let mut last = 0;
        for probe in Probe::ALL {
            let label = format!("{}:", probe.name());
            let at = table.find(&label).expect("probe row missing");
            assert!(at >= last, "{} out of order", probe);
            last = at;
        }
        assert!(table.contains("SUCCESS"));
        assert!(table.contains("FAILED"));
        assert!(table.contains("NOT TESTED"));
        assert!(!table.contains("Error details"));
    }

    #[test]
    fn test_table_includes_error_details() {
        let error = MigrateError::Precondition("VM fedora not found in namespace vms".into());
        let table = render_table(&report(Some(error)));
        assert!(table.contains("Error details: precondition failed: VM fedora not found"));
    }
}
