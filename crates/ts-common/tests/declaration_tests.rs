//! Tests for declaration parsing and traversal.

use ts_common::{DataDisposition, DatasetOrientation, Declaration, DeclaredSource};

// ============================================================================
// Deserialization tests
// ============================================================================

#[test]
fn test_declaration_from_yaml() {
    let yaml = r#"
left:
  - uri: /data/observations
    pattern: "**/*.csv"
    missing_values: [-999.0, -9999.0]
right:
  - uri: https://example.org/api/v1/forecasts
    disposition: JSON_WRDS_NWM
"#;
    let declaration: Declaration = serde_yaml::from_str(yaml).expect("valid declaration");

    assert_eq!(declaration.left.len(), 1);
    assert_eq!(declaration.left[0].pattern.as_deref(), Some("**/*.csv"));
    assert_eq!(declaration.left[0].missing_values, vec![-999.0, -9999.0]);
    assert_eq!(
        declaration.right[0].disposition,
        Some(DataDisposition::JsonWrdsNwm)
    );
    assert!(declaration.baseline.is_empty());
    assert!(declaration.covariates.is_empty());
}

#[test]
fn test_declaration_rejects_unknown_disposition() {
    let yaml = r#"
left:
  - uri: /data/a
    disposition: PARQUET
"#;
    assert!(serde_yaml::from_str::<Declaration>(yaml).is_err());
}

// ============================================================================
// Traversal tests
// ============================================================================

#[test]
fn test_iter_visits_orientations_in_order() {
    let declaration = Declaration {
        left: vec![DeclaredSource::new("a")],
        right: vec![DeclaredSource::new("b"), DeclaredSource::new("c")],
        baseline: vec![DeclaredSource::new("a")],
        covariates: vec![DeclaredSource::new("d")],
    };

    let visited: Vec<(DatasetOrientation, &str)> = declaration
        .iter()
        .map(|(o, s)| (o, s.uri.as_str()))
        .collect();

    assert_eq!(
        visited,
        vec![
            (DatasetOrientation::Left, "a"),
            (DatasetOrientation::Right, "b"),
            (DatasetOrientation::Right, "c"),
            (DatasetOrientation::Baseline, "a"),
            (DatasetOrientation::Covariate, "d"),
        ]
    );
}

#[test]
fn test_builder_sets_fields() {
    let source = DeclaredSource::new("/data")
        .with_pattern("*.xml")
        .with_variable("QINE")
        .with_missing_values(vec![-999.0])
        .with_disposition(DataDisposition::XmlPiTimeseries);

    assert_eq!(source.pattern.as_deref(), Some("*.xml"));
    assert_eq!(source.variable.as_deref(), Some("QINE"));
    assert_eq!(source.disposition, Some(DataDisposition::XmlPiTimeseries));
}
