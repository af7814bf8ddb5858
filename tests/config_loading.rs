//! Configuration loading from TOML

use knowledge_substrate::config::Config;
use knowledge_substrate::KnowledgeError;

#[test]
fn test_partial_toml_keeps_defaults() {
    let config = Config::from_toml_str(
        r#"
        [truth]
        auto_resolve_margin = 0.25

        [working_memory]
        capacity = 8
        half_life_secs = 60.0

        [query.ranking]
        similarity_weight = 0.5
        "#,
    )
    .unwrap();

    assert_eq!(config.truth.auto_resolve_margin, 0.25);
    assert_eq!(config.truth.ingestion_workers, 4);
    assert_eq!(config.working_memory.capacity, 8);
    assert_eq!(config.working_memory.half_life_secs, 60.0);
    assert_eq!(config.query.ranking.similarity_weight, 0.5);
    assert_eq!(config.query.ranking.confidence_weight, 0.3);
    assert_eq!(config.query.deadline_ms, 250);
    assert_eq!(config.server.port, 8081);
}

#[test]
fn test_invalid_values_rejected() {
    let result = Config::from_toml_str(
        r#"
        [query]
        max_hops = 0
        "#,
    );
    assert!(matches!(result, Err(KnowledgeError::Configuration(_))));

    let result = Config::from_toml_str(
        r#"
        [query.ranking]
        recency_weight = -1.0
        "#,
    );
    assert!(result.is_err());
}

#[test]
fn test_load_from_file() {
    let path = std::env::temp_dir().join(format!("knowledge-{}.toml", uuid::Uuid::new_v4()));
    std::fs::write(
        &path,
        r#"
        [logging]
        level = "debug"
        json = true

        [embedding]
        dimension = 384
        "#,
    )
    .unwrap();

    let config = Config::from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json);
    assert_eq!(config.embedding.dimension, Some(384));
}
