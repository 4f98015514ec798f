use clap::Parser;
use eidetic::Engine;
use eidetic::memory::{ConsolidationReport, CycleKind};

use crate::error::CliResult;
use crate::output::{OutputFormat, table};

#[derive(Parser)]
pub struct ConsolidateCommand {
    #[clap(default_value = "sws", help = "Cycle to run (sws, rem)")]
    pub kind: String,
}

impl ConsolidateCommand {
    pub async fn execute(&self, engine: &Engine, format: OutputFormat) -> CliResult<()> {
        let kind: CycleKind = self.kind.parse()?;
        let report = engine.consolidate(kind).await?;
        println!("{}", render(kind, report.as_ref(), format)?);
        Ok(())
    }
}

pub fn render(
    kind: CycleKind,
    report: Option<&ConsolidationReport>,
    format: OutputFormat,
) -> CliResult<String> {
    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "skipped": report.is_none(),
                "report": report,
            });
            Ok(serde_json::to_string_pretty(&output)?)
        }
        OutputFormat::Table => {
            let Some(report) = report else {
                return Ok(format!("A {kind} cycle is already running; nothing was done."));
            };

            let mut out = table(["Metric", "Value"]);
            out.add_row(["Cycle".to_string(), report.kind.to_string()]);
            out.add_row(["Records Scanned".to_string(), report.records_scanned.to_string()]);
            out.add_row(["Records Updated".to_string(), report.records_updated.to_string()]);
            out.add_row(["Dormant".to_string(), report.dormant_count.to_string()]);
            out.add_row(["Edges Reinforced".to_string(), report.edges_reinforced.to_string()]);
            out.add_row(["Records Re-routed".to_string(), report.records_rerouted.to_string()]);
            out.add_row(["Failures".to_string(), report.failures.to_string()]);
            out.add_row(["Duration".to_string(), format!("{} ms", report.duration_ms)]);
            if report.cancelled {
                out.add_row(["Cancelled".to_string(), "yes".to_string()]);
            }
            Ok(out.to_string())
        }
    }
}
