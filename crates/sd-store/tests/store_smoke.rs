use std::fs;
use std::path::PathBuf;

use proptest::prelude::*;
use sd_core::Tolerances;
use sd_store::{FileParameterStore, ParameterStore, StoreError, StoreLayout};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}_{}", prefix, uuid::Uuid::new_v4()))
}

fn parameter_store(root: PathBuf) -> FileParameterStore {
    let layout = StoreLayout {
        root,
        lookup_file_name: "parameters_lookup.json".to_string(),
        entry_prefix: "parameter_set_".to_string(),
        entry_width: 5,
        value_file_names: vec!["parameters.json".to_string()],
    };
    FileParameterStore::new(
        layout,
        Tolerances {
            abs: 1e-12,
            rel: 1e-6,
        },
        12,
    )
}

#[test]
fn missing_store_is_empty() {
    let store = parameter_store(unique_temp_dir("sd_store_missing"));
    assert!(!store.exists());
    assert_eq!(store.len().unwrap(), 0);
    assert_eq!(store.closest_index(&[1.0, 2.0]).unwrap(), None);
    assert_eq!(store.all_values().unwrap().count(), 0);
}

#[test]
fn values_within_tolerance_share_an_index() {
    let store = parameter_store(unique_temp_dir("sd_store_fuzzy"));

    let first = store.get_or_add_index(&[0.02, 2.0, 0.5]).unwrap();
    let second = store.get_or_add_index(&[0.02 * (1.0 + 1e-8), 2.0, 0.5]).unwrap();
    let other = store.get_or_add_index(&[0.03, 2.0, 0.5]).unwrap();

    assert_eq!(first, 0);
    assert_eq!(second, first);
    assert_eq!(other, 1);
    assert_eq!(store.len().unwrap(), 2);
    assert_eq!(store.get_value(1).unwrap(), vec![0.03, 2.0, 0.5]);
    assert!(store.entry_dir(1).join("parameters.json").is_file());
    store.check_integrity().unwrap();
}

#[test]
fn closest_index_ignores_tolerance() {
    let store = parameter_store(unique_temp_dir("sd_store_closest"));
    store.get_or_add_index(&[1.0, 1.0]).unwrap();
    store.get_or_add_index(&[5.0, 5.0]).unwrap();

    assert_eq!(store.index(&[4.0, 4.5]).unwrap(), None);
    assert_eq!(store.closest_index(&[4.0, 4.5]).unwrap(), Some(1));
    assert_eq!(store.closest_index(&[1.5, 0.0]).unwrap(), Some(0));
}

#[test]
fn indices_by_distance_orders_nearest_first() {
    let store = parameter_store(unique_temp_dir("sd_store_distance"));
    for p in [[1.0, 1.0], [5.0, 5.0], [3.0, 3.0]] {
        store.get_or_add_index(&p).unwrap();
    }
    store.get_or_add_index(&[3.0]).unwrap();

    assert_eq!(store.indices_by_distance(&[4.9, 5.0]).unwrap(), vec![1, 2, 0]);
    assert_eq!(store.indices_by_distance(&[0.0]).unwrap(), vec![3]);
    assert!(store.indices_by_distance(&[0.0, 0.0, 0.0]).unwrap().is_empty());
}

#[test]
fn all_values_is_restartable() {
    let store = parameter_store(unique_temp_dir("sd_store_iter"));
    for p in [1.0, 2.0, 3.0] {
        store.get_or_add_index(&[p]).unwrap();
    }

    let first_pass: Vec<Vec<f64>> = store.all_values().unwrap().map(|v| v.unwrap()).collect();
    let second_pass: Vec<Vec<f64>> = store.all_values().unwrap().map(|v| v.unwrap()).collect();
    assert_eq!(first_pass, vec![vec![1.0], vec![2.0], vec![3.0]]);
    assert_eq!(first_pass, second_pass);
}

#[test]
fn tampered_value_file_fails_integrity_check() {
    let store = parameter_store(unique_temp_dir("sd_store_tampered"));
    store.get_or_add_index(&[1.0, 2.0]).unwrap();
    fs::write(store.entry_dir(0).join("parameters.json"), "[1.0, 3.0]").unwrap();

    let err = store.check_integrity().unwrap_err();
    assert!(matches!(err, StoreError::Integrity { .. }));
}

#[test]
fn missing_entry_dir_fails_integrity_check() {
    let store = parameter_store(unique_temp_dir("sd_store_missing_entry"));
    store.get_or_add_index(&[1.0]).unwrap();
    fs::remove_dir_all(store.entry_dir(0)).unwrap();

    assert!(matches!(
        store.check_integrity(),
        Err(StoreError::Integrity { .. })
    ));
}

#[test]
fn concentration_fields_are_split_across_value_files() {
    let layout = StoreLayout {
        root: unique_temp_dir("sd_store_vector"),
        lookup_file_name: "lookup.json".to_string(),
        entry_prefix: "concentration_".to_string(),
        entry_width: 3,
        value_file_names: vec!["N_input.json".to_string(), "DOP_input.json".to_string()],
    };
    let store = FileParameterStore::new(layout, Tolerances::default(), 12);

    let index = store.get_or_add_index(&[2.0, 2.1, 0.1, 0.2]).unwrap();
    let files = store.value_files(index).unwrap();
    assert_eq!(files.len(), 2);
    let dop: Vec<f64> = serde_json::from_str(&fs::read_to_string(&files[1]).unwrap()).unwrap();
    assert_eq!(dop, vec![0.1, 0.2]);
    assert_eq!(store.get_value(index).unwrap(), vec![2.0, 2.1, 0.1, 0.2]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn store_growth_is_idempotent(
        base in prop::collection::vec(0.1_f64..10.0, 1..5),
        jitter in -1e-9_f64..1e-9,
    ) {
        let store = parameter_store(unique_temp_dir("sd_store_prop"));
        let nearby: Vec<f64> = base.iter().map(|v| v * (1.0 + jitter)).collect();

        let first = store.get_or_add_index(&base).unwrap();
        let second = store.get_or_add_index(&nearby).unwrap();
        let third = store.get_or_add_index(&base).unwrap();

        prop_assert_eq!(first, second);
        prop_assert_eq!(first, third);
        prop_assert_eq!(store.len().unwrap(), 1);
    }
}
