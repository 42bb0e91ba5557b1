use anyhow::Result;

use crate::config::Config;
use crate::models::PipelineFamily;
use crate::pipeline::PipelineRegistry;

/// One line of the `stacksync sources` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub family: PipelineFamily,
    pub entities: String,
    pub source: String,
    pub kind: &'static str,
    pub description: String,
}

pub fn source_rows(registry: &PipelineRegistry) -> Vec<SourceRow> {
    let mut rows = Vec::new();
    for family in PipelineFamily::ALL {
        for pipeline in registry.pipelines(family) {
            let entities = pipeline
                .entities()
                .iter()
                .map(|e| e.as_str())
                .collect::<Vec<_>>()
                .join(" > ");
            for extractor in pipeline.extractors() {
                rows.push(SourceRow {
                    family,
                    entities: entities.clone(),
                    source: extractor.name().to_string(),
                    kind: extractor.kind().as_str(),
                    description: extractor.description().to_string(),
                });
            }
        }
    }
    rows
}

pub fn list_sources(config: &Config) -> Result<()> {
    let registry = PipelineRegistry::from_config(config)?;
    let rows = source_rows(&registry);

    println!(
        "{:<8} {:<26} {:<14} {:<12} DESCRIPTION",
        "FAMILY", "ENTITY", "SOURCE", "KIND"
    );
    for row in &rows {
        println!(
            "{:<8} {:<26} {:<14} {:<12} {}",
            row.family.as_str(),
            row.entities,
            row.source,
            row.kind,
            row.description
        );
    }

    if !config.media_server.enabled {
        println!();
        println!("media family disabled ([media_server].enabled = false)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stack_rows() {
        let config: Config = toml::from_str(
            "[catalog]\nurl = \"http://catalog.test\"\n[media_server]\nurl = \"http://jellyfin:8096\"\n",
        )
        .unwrap();
        let registry = PipelineRegistry::from_config(&config).unwrap();
        let rows = source_rows(&registry);

        let backups = rows
            .iter()
            .filter(|r| r.family == PipelineFamily::Backup)
            .count();
        assert_eq!(backups, 7);
        assert!(rows
            .iter()
            .any(|r| r.entities == "media > episode" && r.kind == "remote_api"));
        assert!(rows
            .iter()
            .any(|r| r.entities == "indexer" && r.source == "prowlarr"));
    }
}
