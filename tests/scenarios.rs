//! End-to-end behaviour across the substrate components

use chrono::{DateTime, Duration, TimeZone, Utc};
use knowledge_substrate::config::Config;
use knowledge_substrate::facts::LiteralKind;
use knowledge_substrate::prelude::*;
use knowledge_substrate::truth::{ConflictStatus, RawCandidate};
use serde_json::json;
use std::sync::Arc;

fn ts(year: i32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap()
}

struct World {
    substrate: Substrate,
    clock: Arc<ManualClock>,
    company: EntityId,
    alice: EntityId,
    bob: EntityId,
}

fn world() -> World {
    world_with(Config::default())
}

fn world_with(config: Config) -> World {
    let clock = Arc::new(ManualClock::new(ts(2020)));
    let substrate = Substrate::with_clock(config, clock.clone()).unwrap();
    let schema = substrate.schema();
    let proposal = schema
        .propose_change(
            SchemaDiff::new()
                .add_entity_type(EntityTypeDef::new("Company"))
                .add_entity_type(EntityTypeDef::new("Person"))
                .upsert_predicate(PredicateDef::new(
                    "ceo",
                    "Company",
                    RangeSpec::Entity("Person".into()),
                ))
                .upsert_predicate(
                    PredicateDef::new("advisor", "Company", RangeSpec::Entity("Person".into()))
                        .multi_valued(),
                ),
        )
        .unwrap();
    schema.approve(proposal).unwrap();

    let truth = substrate.truth();
    let company = truth.create_entity(NewEntity::new("Company", "CompanyX")).unwrap().id;
    let alice = truth.create_entity(NewEntity::new("Person", "Alice")).unwrap().id;
    let bob = truth.create_entity(NewEntity::new("Person", "Bob")).unwrap().id;
    World {
        substrate,
        clock,
        company,
        alice,
        bob,
    }
}

fn raw(value: serde_json::Value) -> RawCandidate {
    serde_json::from_value(value).unwrap()
}

#[test]
fn test_conflict_scenario_keeps_credible_head() {
    let w = world();
    let truth = w.substrate.truth();

    let first = truth
        .ingest(&raw(json!({
            "subject": "CompanyX",
            "predicate": "ceo",
            "object": { "entity": "Alice" },
            "source": "S1",
            "observedAt": "2020-01-01T00:00:00Z",
            "credibilityHint": 0.9
        })))
        .unwrap();
    assert_eq!(first.label(), "committed");

    let second = truth
        .ingest(&raw(json!({
            "subject": "CompanyX",
            "predicate": "ceo",
            "object": { "entity": "Bob" },
            "source": "S2",
            "observedAt": "2020-01-01T00:00:00Z",
            "credibilityHint": 0.3
        })))
        .unwrap();

    let conflict = truth.conflict(&second.conflict().unwrap()).unwrap();
    assert_eq!(conflict.status, ConflictStatus::AutoResolved);

    let current = w.substrate.store().get_current_facts(&w.company, Some("ceo"));
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].object, FactObject::Entity(w.alice));
}

#[test]
fn test_schema_scenario_market_cap_requires_approval() {
    let w = world();
    let truth = w.substrate.truth();
    let record = raw(json!({
        "subject": "CompanyX",
        "predicate": "marketCapUSD",
        "object": 1.5e12,
        "source": "filings",
        "observedAt": "2020-01-01T00:00:00Z"
    }));

    let before = truth.ingest(&record);
    assert!(matches!(
        before,
        Err(KnowledgeError::SchemaViolation(ValidationError::UnknownPredicate(_)))
    ));

    let schema = w.substrate.schema();
    let proposal = schema
        .propose_change(SchemaDiff::new().upsert_predicate(PredicateDef::new(
            "marketCapUSD",
            "Company",
            RangeSpec::Literal(LiteralKind::Float),
        )))
        .unwrap();
    // Pending proposals never validate anything
    assert!(truth.ingest(&record).is_err());

    schema.approve(proposal).unwrap();
    let after = truth.ingest(&record).unwrap();
    assert_eq!(after.label(), "committed");
    assert_eq!(after.fact().unwrap().schema_version, 2);
}

#[test]
fn test_temporal_scenario_as_of_reads() {
    let w = world();
    let store = w.substrate.store();

    let alice = store
        .assert_fact(
            FactCandidate::new(
                w.company,
                "ceo",
                FactObject::Entity(w.alice),
                Provenance::new("S1", ts(2020)),
            )
            .valid_from(ts(2020)),
            None,
        )
        .unwrap();

    w.clock.set(ts(2023));
    store
        .assert_fact(
            FactCandidate::new(
                w.company,
                "ceo",
                FactObject::Entity(w.bob),
                Provenance::new("S1", ts(2023)),
            )
            .valid_from(ts(2023)),
            Some(alice.id),
        )
        .unwrap();

    let in_2021 = store.get_facts_as_of(&w.company, Some("ceo"), ts(2021));
    assert_eq!(in_2021.len(), 1);
    assert_eq!(in_2021[0].object, FactObject::Entity(w.alice));

    let in_2024 = store.get_facts_as_of(&w.company, Some("ceo"), ts(2024));
    assert_eq!(in_2024.len(), 1);
    assert_eq!(in_2024[0].object, FactObject::Entity(w.bob));

    // Repeated reads agree
    assert_eq!(in_2021, store.get_facts_as_of(&w.company, Some("ceo"), ts(2021)));
}

#[test]
fn test_transaction_time_hides_later_knowledge() {
    let w = world();
    let store = w.substrate.store();
    w.clock.set(ts(2022));
    store
        .assert_fact(
            FactCandidate::new(
                w.company,
                "ceo",
                FactObject::Entity(w.alice),
                Provenance::new("S1", ts(2022)),
            )
            .valid_from(ts(2020)),
            None,
        )
        .unwrap();

    // Valid in 2021, but nobody knew until 2022
    assert!(store.get_facts_as_of(&w.company, Some("ceo"), ts(2021)).is_empty());
    let known_later = store.facts_bitemporal(&w.company, Some("ceo"), ts(2021), ts(2023));
    assert_eq!(known_later.len(), 1);
}

#[test]
fn test_decay_eviction_scenario() {
    let mut config = Config::default();
    config.working_memory.capacity = 3;
    let w = world_with(config);
    let memory = w.substrate.memory();
    let session = memory.open_session();

    let x = NodeRef::Entity(w.alice);
    memory
        .stage(session, vec![StageRequest::new(x).with_activation(0.8)], "query")
        .unwrap();
    w.clock.advance(Duration::seconds(
        memory.config().half_life_secs as i64,
    ));
    assert!(memory.activation(session, &x).unwrap().unwrap() < 0.8);

    let y = NodeRef::Entity(w.bob);
    let z = NodeRef::Entity(w.company);
    memory
        .stage(
            session,
            vec![
                StageRequest::new(y).with_activation(0.9),
                StageRequest::new(z).with_activation(0.85),
            ],
            "query",
        )
        .unwrap();

    let newcomer = NodeRef::Entity(EntityId::new());
    let outcomes = memory
        .stage(session, vec![StageRequest::new(newcomer).with_activation(0.7)], "query")
        .unwrap();
    assert_eq!(
        outcomes[0],
        StageOutcome::Inserted {
            node: newcomer,
            activation: 0.7,
            evicted: Some(x),
        }
    );

    let snapshot = memory.snapshot(session).unwrap();
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.iter().all(|item| item.node != x));
}

#[test]
fn test_assert_then_get_returns_content() {
    let w = world();
    let store = w.substrate.store();
    let candidate = FactCandidate::new(
        w.company,
        "ceo",
        FactObject::Entity(w.alice),
        Provenance::new("S1", ts(2020)).with_credibility(0.8),
    );

    let fact = store.assert_fact(candidate.clone(), None).unwrap();
    let read = store.get_fact(&fact.id).unwrap();
    assert_eq!(read.subject, candidate.subject);
    assert_eq!(read.predicate, candidate.predicate);
    assert_eq!(read.object, candidate.object);
    assert_eq!(read.valid_from, candidate.valid_from);
    assert_eq!(read.version, 1);
    assert_eq!(read.assertion_time, ts(2020));
}

#[tokio::test]
async fn test_concurrent_ingestion_preserves_invariants() {
    let w = world();
    let pipeline = w.substrate.start_pipeline();

    let mut records = Vec::new();
    for i in 0..40 {
        let (person, predicate) = match i % 4 {
            0 => ("Alice", "ceo"),
            1 => ("Bob", "ceo"),
            2 => ("Alice", "advisor"),
            _ => ("Bob", "advisor"),
        };
        records.push(raw(json!({
            "subject": "CompanyX",
            "predicate": predicate,
            "object": { "entity": person },
            "source": format!("S{}", i),
            "observedAt": "2020-01-01T00:00:00Z",
            "credibilityHint": (i % 10) as f64 / 10.0
        })));
    }

    let submissions = records.into_iter().map(|r| pipeline.submit_raw(r));
    for result in futures::future::join_all(submissions).await {
        result.unwrap();
    }
    pipeline.shutdown().await;

    let store = w.substrate.store();
    assert!(store.check_invariants().is_empty());
    assert_eq!(store.get_current_facts(&w.company, Some("ceo")).len(), 1);
    assert_eq!(store.get_current_facts(&w.company, Some("advisor")).len(), 2);

    let history = store.get_history(&w.company, "ceo");
    assert!(history.windows(2).all(|pair| pair[0].version < pair[1].version));
}

#[test]
fn test_query_results_stage_into_working_memory() {
    let w = world();
    let store = w.substrate.store();
    store
        .assert_fact(
            FactCandidate::new(
                w.company,
                "ceo",
                FactObject::Entity(w.alice),
                Provenance::new("S1", ts(2020)).with_credibility(0.9),
            ),
            None,
        )
        .unwrap();
    w.clock.set(ts(2021));

    let response = w
        .substrate
        .query_engine()
        .query(
            &QueryRequest::new(
                GraphPattern::from_name("CompanyX").step(PathStep::along("ceo")),
            ),
            None,
        )
        .unwrap();
    assert_eq!(response.status, QueryStatus::Complete);
    assert_eq!(response.matches.len(), 1);
    assert_eq!(response.matches[0].terminal, NodeRef::Entity(w.alice));

    let memory = w.substrate.memory();
    let session = memory.open_session();
    let outcomes = memory
        .stage_query_results(session, &response, "ceo-lookup")
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    let snapshot = memory.snapshot(session).unwrap();
    assert_eq!(snapshot[0].node, NodeRef::Entity(w.alice));
    assert_eq!(snapshot[0].source_tag, "ceo-lookup");
}

#[tokio::test]
async fn test_curation_sweep_flags_without_deleting() {
    let w = world();
    let store = w.substrate.store();
    store
        .assert_fact(
            FactCandidate::new(
                w.company,
                "advisor",
                FactObject::Entity(w.bob),
                Provenance::new("S1", ts(2020)),
            ),
            None,
        )
        .unwrap();

    let schema = w.substrate.schema();
    let proposal = schema
        .propose_change(SchemaDiff::new().remove_predicate("advisor"))
        .unwrap();
    schema.approve(proposal).unwrap();

    let report = w.substrate.curation_sweep(CancelHandle::new()).await.unwrap();
    assert_eq!(report.flagged.len(), 1);
    assert_eq!(store.get_current_facts(&w.company, Some("advisor")).len(), 1);
}

#[test]
fn test_later_corroboration_leaves_earlier_reads_untouched() {
    let w = world();
    let truth = w.substrate.truth();
    let store = w.substrate.store();
    let claim = |source: &str, at| {
        FactCandidate::new(
            w.company,
            "ceo",
            FactObject::Entity(w.alice),
            Provenance::new(source, at).with_credibility(0.8),
        )
        .valid_from(ts(2020))
    };

    let fact = truth.process(claim("S1", ts(2020))).unwrap().fact().unwrap().clone();
    let pinned = store.snapshot();

    w.clock.set(ts(2025));
    let merged = truth.process(claim("S2", ts(2025))).unwrap();
    assert_eq!(merged.label(), "merged");

    let seen = pinned.current_facts(&w.company, Some("ceo"));
    assert_eq!(seen[0].provenance.len(), 1);

    let in_2020 = store.get_facts_as_of(&w.company, Some("ceo"), ts(2020));
    assert_eq!(in_2020[0].provenance.len(), 1);
    assert_eq!(in_2020[0].confidence, fact.confidence);

    let now = store.get_fact(&fact.id).unwrap();
    assert_eq!(now.provenance.len(), 2);
    assert_eq!(now.version, 1);
}
