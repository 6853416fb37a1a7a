//! PostgreSQL adapter integration tests.
//!
//! These need a running server; point `ESTAT_TEST_DATABASE_URL` at a
//! disposable database and run with `cargo test -- --ignored`.

use std::collections::BTreeMap;

use estat_load::loader::{Loader, PostgresLoader};
use estat_load::models::{
    Attribute, Code, Codelist, Dimension, Dsd, FinalizeStrategy, IngestionHistory,
    IngestionStatus, LoadStrategy, Observation, Representation,
};
use estat_load::{EstatError, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

fn test_url() -> String {
    std::env::var("ESTAT_TEST_DATABASE_URL")
        .expect("set ESTAT_TEST_DATABASE_URL to run the PostgreSQL tests")
}

/// Each test works in its own schema pair so parallel runs cannot collide.
async fn setup(prefix: &str) -> (PostgresLoader, PgPool, String, String) {
    let url = test_url();
    let loader = PostgresLoader::connect_url(&url).await.unwrap();
    let verify = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .unwrap();

    let data_schema = format!("{prefix}_data");
    let meta_schema = format!("{prefix}_meta");
    for schema in [&data_schema, &meta_schema] {
        sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE"))
            .execute(&verify)
            .await
            .unwrap();
    }
    (loader, verify, data_schema, meta_schema)
}

fn sample_dsd() -> Dsd {
    Dsd {
        id: "demo".into(),
        name: None,
        version: "1.0".into(),
        dimensions: vec![
            Dimension {
                id: "geo".into(),
                name: None,
                codelist_id: Some("CL_GEO".into()),
                position: 0,
            },
            Dimension {
                id: "freq".into(),
                name: None,
                codelist_id: None,
                position: 1,
            },
        ],
        time_dimension: "time".into(),
        attributes: vec![Attribute {
            id: "obs_flag".into(),
            name: None,
            codelist_id: None,
        }],
        primary_measure_id: "obs_value".into(),
    }
}

fn obs(geo: &str, period: &str, value: Option<f64>, flags: Option<&str>) -> Observation {
    Observation {
        dimensions: vec![("geo".into(), geo.into()), ("freq".into(), "A".into())],
        time_period: period.into(),
        value,
        flags: flags.map(|s| s.to_string()),
    }
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server via ESTAT_TEST_DATABASE_URL"]
async fn test_copy_staging_and_swap() {
    let (mut loader, verify, data, _meta) = setup("estat_t1").await;
    let dsd = sample_dsd();
    loader
        .prepare_schema(&dsd, "data_demo", &data, None)
        .await
        .unwrap();

    let rows = vec![
        obs("DE", "2020", Some(10.5), None),
        obs("DE", "2021", Some(11.0), Some("p")),
        obs("FR", "2020", None, None),
        obs("FR", "2021", Some(9.0), None),
    ];
    let mut stream = rows.into_iter().map(Ok::<_, EstatError>);
    let (staging, count) = loader
        .bulk_load_staging("data_demo", &data, &mut stream, true)
        .await
        .unwrap();
    assert_eq!(count, 4);

    // The staging table was created unlogged.
    let persistence: String = sqlx::query_scalar(
        "SELECT relpersistence::text FROM pg_class c
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1 AND c.relname = $2",
    )
    .bind(&data)
    .bind(&staging)
    .fetch_one(&verify)
    .await
    .unwrap();
    assert_eq!(persistence, "u");

    loader
        .finalize_load(&staging, "data_demo", &data, FinalizeStrategy::Swap)
        .await
        .unwrap();

    let values: Vec<(String, Option<f64>, Option<String>)> = sqlx::query(&format!(
        "SELECT geo, obs_value, obs_flag FROM \"{data}\".\"data_demo\" ORDER BY geo, time_period"
    ))
    .fetch_all(&verify)
    .await
    .unwrap()
    .into_iter()
    .map(|r| (r.get(0), r.get(1), r.get(2)))
    .collect();

    assert_eq!(
        values,
        vec![
            ("DE".into(), Some(10.5), None),
            ("DE".into(), Some(11.0), Some("p".into())),
            ("FR".into(), None, None),
            ("FR".into(), Some(9.0), None),
        ]
    );
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server via ESTAT_TEST_DATABASE_URL"]
async fn test_swap_is_atomic_under_reader_pressure() {
    let (mut loader, verify, data, _meta) = setup("estat_t2").await;
    let dsd = sample_dsd();
    loader
        .prepare_schema(&dsd, "data_demo", &data, None)
        .await
        .unwrap();

    // Pre-load two rows.
    let mut stream = vec![
        obs("DE", "2020", Some(1.0), None),
        obs("FR", "2020", Some(2.0), None),
    ]
    .into_iter()
    .map(Ok::<_, EstatError>);
    let (staging, _) = loader
        .bulk_load_staging("data_demo", &data, &mut stream, true)
        .await
        .unwrap();
    loader
        .finalize_load(&staging, "data_demo", &data, FinalizeStrategy::Swap)
        .await
        .unwrap();

    // Reader hammering count(*) while the swap to five rows happens.
    let count_sql = format!("SELECT count(*) FROM \"{data}\".\"data_demo\"");
    let reader_pool = verify.clone();
    let reader_sql = count_sql.clone();
    let reader = tokio::spawn(async move {
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..200 {
            let count: i64 = sqlx::query_scalar(&reader_sql)
                .fetch_one(&reader_pool)
                .await
                .expect("reader must never observe a missing table");
            seen.insert(count);
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        seen
    });

    let mut stream = (0..5)
        .map(|i| obs("DE", &format!("20{i:02}"), Some(i as f64), None))
        .map(Ok::<_, EstatError>);
    let (staging, _) = loader
        .bulk_load_staging("data_demo", &data, &mut stream, true)
        .await
        .unwrap();
    loader
        .finalize_load(&staging, "data_demo", &data, FinalizeStrategy::Swap)
        .await
        .unwrap();

    let seen = reader.await.unwrap();
    // Only the pre-swap and post-swap row sets are ever visible.
    for count in seen {
        assert!(count == 2 || count == 5, "saw interleaved count {count}");
    }
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server via ESTAT_TEST_DATABASE_URL"]
async fn test_merge_upserts_on_composite_key() {
    let (mut loader, verify, data, _meta) = setup("estat_t3").await;
    loader
        .prepare_schema(&sample_dsd(), "data_demo", &data, None)
        .await
        .unwrap();

    let mut stream = vec![obs("DE", "2021", Some(11.0), None)]
        .into_iter()
        .map(Ok::<_, EstatError>);
    let (staging, _) = loader
        .bulk_load_staging("data_demo", &data, &mut stream, false)
        .await
        .unwrap();
    loader
        .finalize_load(&staging, "data_demo", &data, FinalizeStrategy::Swap)
        .await
        .unwrap();

    let mut stream = vec![
        obs("DE", "2021", Some(12.0), Some("p")),
        obs("DE", "2022", Some(13.0), None),
    ]
    .into_iter()
    .map(Ok::<_, EstatError>);
    let (staging, _) = loader
        .bulk_load_staging("data_demo", &data, &mut stream, false)
        .await
        .unwrap();
    loader
        .finalize_load(&staging, "data_demo", &data, FinalizeStrategy::Merge)
        .await
        .unwrap();

    let rows: Vec<(String, Option<f64>, Option<String>)> = sqlx::query(&format!(
        "SELECT time_period, obs_value, obs_flag FROM \"{data}\".\"data_demo\" ORDER BY time_period"
    ))
    .fetch_all(&verify)
    .await
    .unwrap()
    .into_iter()
    .map(|r| (r.get(0), r.get(1), r.get(2)))
    .collect();

    assert_eq!(
        rows,
        vec![
            ("2021".into(), Some(12.0), Some("p".into())),
            ("2022".into(), Some(13.0), None),
        ]
    );
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server via ESTAT_TEST_DATABASE_URL"]
async fn test_codelists_staged_merge_idempotent() {
    let (mut loader, verify, _data, meta) = setup("estat_t4").await;

    let mut codes = BTreeMap::new();
    codes.insert(
        "DE".to_string(),
        Code {
            id: "DE".into(),
            label: "Germany".into(),
            description: Some("Federal Republic".into()),
            parent_code: None,
        },
    );
    let mut lists = BTreeMap::new();
    lists.insert(
        "CL_GEO".to_string(),
        Codelist {
            id: "CL_GEO".into(),
            version: "1.0".into(),
            codes,
        },
    );

    loader.manage_codelists(&lists, &meta).await.unwrap();
    loader.manage_codelists(&lists, &meta).await.unwrap();

    let (count, label): (i64, String) = sqlx::query(&format!(
        "SELECT count(*) OVER (), label FROM \"{meta}\".\"cl_geo\" WHERE code = 'DE'"
    ))
    .fetch_one(&verify)
    .await
    .map(|r| (r.get(0), r.get(1)))
    .unwrap();
    assert_eq!(count, 1);
    assert_eq!(label, "Germany");
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server via ESTAT_TEST_DATABASE_URL"]
async fn test_history_round_trip_and_schema_conflict() {
    let (mut loader, verify, data, meta) = setup("estat_t5").await;

    let mut record =
        IngestionHistory::started("demo", LoadStrategy::Delta, Representation::Standard);
    record.status = IngestionStatus::Success;
    record.end_time = Some(chrono::Utc::now());
    record.rows_loaded = Some(7);
    record.source_last_update = Some(chrono::Utc::now());
    loader.save_ingestion_state(&record, &meta).await.unwrap();

    let state = loader
        .get_ingestion_state("demo", &meta)
        .await
        .unwrap()
        .expect("stored record");
    assert_eq!(state.rows_loaded, Some(7));
    assert_eq!(state.status, IngestionStatus::Success);

    // Incompatible value column is reported, never coerced.
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{data}\""))
        .execute(&verify)
        .await
        .unwrap();
    sqlx::query(&format!(
        "CREATE TABLE \"{data}\".\"data_demo\" (
             geo TEXT, freq TEXT, time_period TEXT,
             obs_value TEXT, obs_flag TEXT,
             PRIMARY KEY (geo, freq, time_period)
         )"
    ))
    .execute(&verify)
    .await
    .unwrap();

    let err = loader
        .prepare_schema(&sample_dsd(), "data_demo", &data, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EstatError::SchemaEvolutionConflict { .. }));
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server via ESTAT_TEST_DATABASE_URL"]
async fn test_upstream_error_aborts_copy() {
    let (mut loader, verify, data, _meta) = setup("estat_t6").await;
    loader
        .prepare_schema(&sample_dsd(), "data_demo", &data, None)
        .await
        .unwrap();

    let mut stream = vec![
        Ok(obs("DE", "2020", Some(1.0), None)),
        Err(EstatError::tsv_malformed(3, "broken row")),
    ]
    .into_iter();
    let err: Result<(String, u64)> = loader
        .bulk_load_staging("data_demo", &data, &mut stream, false)
        .await;
    assert!(matches!(err, Err(EstatError::TsvMalformed { .. })));

    // The abandoned staging table is reaped by a later prepare once old
    // enough; right now it simply must not have become the target.
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT count(*) FROM \"{data}\".\"data_demo\""
    ))
    .fetch_one(&verify)
    .await
    .unwrap();
    assert_eq!(count, 0);
}
