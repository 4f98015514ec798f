use clap::Parser;
use eidetic::Engine;
use eidetic::memory::{Category, MatchType, RecallRequest, RecallResponse};

use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, table, truncate_string};

#[derive(Parser)]
pub struct RecallCommand {
    #[clap(help = "Query text")]
    pub query: String,

    #[clap(long = "type", short = 't', help = "Only records of this entity type")]
    pub entity_type: Option<String>,

    #[clap(long, help = "Only records in this category")]
    pub category: Option<String>,

    #[clap(long, short, help = "Maximum number of results")]
    pub limit: Option<usize>,

    #[clap(long, help = "Do not follow relationships from matches")]
    pub no_graph: bool,
}

impl RecallCommand {
    pub fn request(&self) -> CliResult<RecallRequest> {
        let mut request = RecallRequest::new(&self.query).with_graph(!self.no_graph);
        if let Some(entity_type) = &self.entity_type {
            request = request.with_entity_type(entity_type);
        }
        if let Some(category) = &self.category {
            request = request.with_category(category.parse::<Category>()?);
        }
        if let Some(limit) = self.limit {
            request = request.with_max_results(limit);
        }
        Ok(request)
    }

    pub async fn execute(&self, engine: &Engine, format: OutputFormat) -> CliResult<()> {
        let response = engine.recall(self.request()?).await?;
        println!("{}", render(&response, format)?);
        Ok(())
    }
}

fn match_label(result_match: MatchType, relation: Option<&str>) -> String {
    match (result_match, relation) {
        (MatchType::Related, Some(relation)) => format!("related ({relation})"),
        (MatchType::Related, None) => "related".to_string(),
        (MatchType::Vector, _) => "vector".to_string(),
        (MatchType::Text, _) => "text".to_string(),
    }
}

pub fn render(response: &RecallResponse, format: OutputFormat) -> CliResult<String> {
    if let OutputFormat::Json = format {
        return Ok(serde_json::to_string_pretty(response)?);
    }

    if response.results.is_empty() {
        return Ok("No memories found.".to_string());
    }

    let mut out = table([
        "Name", "Type", "Category", "Score", "Similarity", "Weight", "Match", "Content",
        "Last Accessed",
    ]);
    for result in &response.results {
        out.add_row([
            result.name.clone(),
            result.entity_type.clone(),
            result.category.to_string(),
            format!("{:.3}", result.score),
            format!("{:.3}", result.similarity),
            format!("{:.2}", result.weight),
            match_label(result.match_type, result.relation_type.as_deref()),
            truncate_string(&result.content, 50),
            format_timestamp(&result.last_accessed),
        ]);
    }

    let mut rendered = format!(
        "{out}\n\nShowing {} of {} (embedding: {:?})",
        response.results.len(),
        response.total_found,
        response.embedding_source
    );
    if response.degraded {
        rendered.push_str(&format!(
            "\nDegraded: {}",
            response.degraded_backends.join(", ")
        ));
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eidetic::engine::StoreRequest;
    use eidetic::testing::test_engine;

    #[test]
    fn test_request_from_args() {
        let command = RecallCommand {
            query: "capital".to_string(),
            entity_type: Some("city".to_string()),
            category: Some("semantic".to_string()),
            limit: Some(5),
            no_graph: true,
        };

        let request = command.request().unwrap();
        assert_eq!(request.entity_type.as_deref(), Some("city"));
        assert_eq!(request.category, Some(Category::Semantic));
        assert_eq!(request.max_results, Some(5));
        assert!(!request.include_graph);
    }

    #[tokio::test]
    async fn test_render_results() {
        let engine = test_engine();
        engine
            .store(StoreRequest::new("city", "paris", "Paris is the capital of France"))
            .await
            .unwrap();

        let response = engine.recall(RecallRequest::new("capital")).await.unwrap();
        let rendered = render(&response, OutputFormat::Table).unwrap();

        assert!(rendered.contains("paris"));
        assert!(rendered.contains("Showing 1 of 1"));
    }

    #[test]
    fn test_match_labels() {
        assert_eq!(match_label(MatchType::Related, Some("near")), "related (near)");
        assert_eq!(match_label(MatchType::Text, None), "text");
    }
}
