use clap::Parser;
use eidetic::Engine;
use eidetic::engine::{StoreRequest, StoreResponse};
use eidetic::memory::Category;

use crate::error::CliResult;
use crate::output::{OutputFormat, table};

#[derive(Parser)]
pub struct StoreCommand {
    #[clap(help = "Record name, unique within its entity type")]
    pub name: String,

    #[clap(help = "Record content")]
    pub content: String,

    #[clap(long = "type", short = 't', default_value = "note", help = "Entity type")]
    pub entity_type: String,

    #[clap(
        long,
        help = "Category (episodic, semantic, procedural, emotional, attention, motor). Routed from content when omitted."
    )]
    pub category: Option<String>,

    #[clap(long = "observation", short = 'o', help = "Observation to attach (repeatable)")]
    pub observations: Vec<String>,
}

impl StoreCommand {
    pub fn request(&self) -> CliResult<StoreRequest> {
        let mut request = StoreRequest::new(&self.entity_type, &self.name, &self.content);
        if let Some(category) = &self.category {
            request = request.with_category(category.parse::<Category>()?);
        }
        request.observations = self.observations.clone();
        request.created_by = Some("cli".to_string());
        Ok(request)
    }

    pub async fn execute(&self, engine: &Engine, format: OutputFormat) -> CliResult<()> {
        let response = engine.store(self.request()?).await?;
        println!("{}", render(&response, format)?);
        Ok(())
    }
}

pub fn render(response: &StoreResponse, format: OutputFormat) -> CliResult<String> {
    if let OutputFormat::Json = format {
        return Ok(serde_json::to_string_pretty(response)?);
    }

    let mut out = table(["Property", "Value"]);
    out.add_row(["ID".to_string(), response.id.to_string()]);
    out.add_row(["Category".to_string(), response.category.to_string()]);
    out.add_row([
        "Status".to_string(),
        if response.created { "created" } else { "already existed" }.to_string(),
    ]);
    if !response.degraded_backends.is_empty() {
        out.add_row([
            "Degraded Backends".to_string(),
            response.degraded_backends.join(", "),
        ]);
    }
    Ok(out.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(category: Option<&str>) -> StoreCommand {
        StoreCommand {
            name: "paris".to_string(),
            content: "Paris is the capital of France".to_string(),
            entity_type: "city".to_string(),
            category: category.map(str::to_string),
            observations: vec!["Home of the Louvre".to_string()],
        }
    }

    #[test]
    fn test_request_from_args() {
        let request = command(Some("Semantic")).request().unwrap();

        assert_eq!(request.entity_type, "city");
        assert_eq!(request.category, Some(Category::Semantic));
        assert_eq!(request.observations.len(), 1);
        assert_eq!(request.created_by.as_deref(), Some("cli"));
    }

    #[test]
    fn test_unknown_category_is_rejected() {
        assert!(command(Some("visual")).request().is_err());
    }
}
