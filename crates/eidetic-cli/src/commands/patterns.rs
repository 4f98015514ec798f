use clap::Parser;
use eidetic::Engine;
use eidetic::memory::{Category, PatternRequest, PatternResponse};

use crate::error::CliResult;
use crate::output::{OutputFormat, table};

#[derive(Parser)]
pub struct PatternsCommand {
    #[clap(long = "type", short = 't', help = "Only records of this entity type")]
    pub entity_type: Option<String>,

    #[clap(long, help = "Only records in this category")]
    pub category: Option<String>,

    #[clap(long, default_value = "3", help = "Smallest cluster to report")]
    pub min_size: usize,
}

impl PatternsCommand {
    pub fn request(&self) -> CliResult<PatternRequest> {
        Ok(PatternRequest {
            entity_type: self.entity_type.clone(),
            category: self
                .category
                .as_deref()
                .map(str::parse::<Category>)
                .transpose()?,
            min_cluster_size: self.min_size,
        })
    }

    pub async fn execute(&self, engine: &Engine, format: OutputFormat) -> CliResult<()> {
        let response = engine.find_patterns(self.request()?).await?;
        println!("{}", render(&response, format)?);
        Ok(())
    }
}

pub fn render(response: &PatternResponse, format: OutputFormat) -> CliResult<String> {
    if let OutputFormat::Json = format {
        return Ok(serde_json::to_string_pretty(response)?);
    }

    if response.clusters.is_empty() {
        return Ok(format!(
            "No clusters found among {} records.",
            response.scanned
        ));
    }

    let mut out = table(["#", "Size", "Cohesion", "Edges", "Members"]);
    for (i, cluster) in response.clusters.iter().enumerate() {
        let members: Vec<String> = cluster
            .members
            .iter()
            .map(|m| format!("{}/{}", m.entity_type, m.name))
            .collect();
        out.add_row([
            (i + 1).to_string(),
            cluster.size.to_string(),
            format!("{:.2}", cluster.cohesion),
            cluster.edge_count.to_string(),
            members.join(", "),
        ]);
    }

    let method = serde_json::to_value(response.method)?;
    let mut rendered = format!(
        "{out}\n\nMethod: {}  Scanned: {}",
        method.as_str().unwrap_or("unknown"),
        response.scanned
    );
    if response.degraded {
        rendered.push_str("\nDegraded: vector index unavailable, clustered by relationships");
    }
    Ok(rendered)
}
