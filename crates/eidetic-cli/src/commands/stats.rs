use clap::Parser;
use eidetic::Engine;
use eidetic::engine::EngineStats;

use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, table};

#[derive(Parser)]
pub struct StatsCommand {
    #[clap(long, help = "Include backend availability and embedding counters")]
    pub verbose: bool,
}

impl StatsCommand {
    pub async fn execute(&self, engine: &Engine, format: OutputFormat) -> CliResult<()> {
        let stats = engine.get_stats().await?;
        println!("{}", self.render(&stats, format)?);
        Ok(())
    }

    pub fn render(&self, stats: &EngineStats, format: OutputFormat) -> CliResult<String> {
        if let OutputFormat::Json = format {
            return Ok(serde_json::to_string_pretty(stats)?);
        }

        let mut out = String::from("Eidetic Statistics\n======================\n\n");

        let mut totals = table(["Records", "Observations", "Relationships"]);
        totals.add_row([
            stats.records.to_string(),
            stats.observations.to_string(),
            stats.relationships.to_string(),
        ]);
        out.push_str(&format!("{totals}\n\n"));

        let mut categories = table(["Category", "Count"]);
        for (category, count) in &stats.per_category {
            categories.add_row([category.to_string(), count.to_string()]);
        }
        out.push_str(&format!("{categories}\n\n"));

        let mut bands = table(["Weight Band", "Count"]);
        for (band, count) in &stats.weight_bands {
            bands.add_row([band.as_str().to_string(), count.to_string()]);
        }
        out.push_str(&format!("{bands}"));

        if self.verbose {
            let mut backends = table(["Backend", "Kind", "Available", "Failures", "Last Checked"]);
            for status in &stats.backend_availability {
                backends.add_row([
                    status.name.clone(),
                    status.kind.to_string(),
                    if status.available { "yes" } else { "no" }.to_string(),
                    status.failures.to_string(),
                    format_timestamp(&status.last_checked),
                ]);
            }
            out.push_str(&format!("\n\n{backends}"));

            let embedding = &stats.embedding;
            out.push_str(&format!(
                "\n\nEmbeddings: provider={} dimension={} calls={} cache_hits={} fallbacks={}",
                embedding.provider.unwrap_or("none"),
                embedding.dimension,
                embedding.provider_calls,
                embedding.cache_hits,
                embedding.fallbacks,
            ));
            out.push_str(&format!(
                "\nClassifier: {}  Recall cache: {} entries  Co-recall pairs: {}",
                stats.classifier, stats.recall_cache_entries, stats.co_recall_pairs
            ));
        }

        Ok(out)
    }
}
