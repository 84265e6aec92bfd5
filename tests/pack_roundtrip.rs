//! End-to-end save/load tests against real directories

use ndarray::{arr2, Array1, ArrayD};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing_subscriber::EnvFilter;
use varpack::error::{Error, Result};
use varpack::{
    LoadOptions, MapMode, Pack, PackConfig, SaveOptions, Value, MANIFEST_FILENAME, MISC_FILENAME,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("Failed to list pack directory")
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn mixed_pack() -> Result<Pack> {
    let mut nested = BTreeMap::new();
    nested.insert("grid".to_string(), Value::from(arr2(&[[1u8, 2], [3, 4]])));
    nested.insert("label".to_string(), Value::from("nested"));

    let mut pack = Pack::new();
    pack.set("scalar", 10)?;
    pack.set("ratio", 0.25)?;
    pack.set("flag", true)?;
    pack.set("nothing", Value::Null)?;
    pack.set("text", "test")?;
    pack.set(
        "list",
        Value::Sequence(vec![Value::from(1), Value::from("two"), Value::from(3.0)]),
    )?;
    pack.set("nested", Value::Mapping(nested))?;
    pack.set("f64s", Array1::<f64>::linspace(0.0, 1.0, 11))?;
    pack.set("f32s", Array1::<f32>::from_elem(3, 2.5))?;
    pack.set("i64s", arr2(&[[1i64, -2, 3], [4, 5, -6]]))?;
    pack.set("i32s", Array1::<i32>::from_vec(vec![7, 8, 9]))?;
    Ok(pack)
}

#[test]
fn test_round_trip() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let mut pack = mixed_pack()?;
    pack.save_to(dir.path(), &SaveOptions::new())?;

    let expected = mixed_pack()?;
    for mode in [Some(MapMode::ReadWrite), Some(MapMode::ReadOnly), None] {
        let loaded = Pack::open(dir.path(), &LoadOptions::default().mmap_mode(mode))?;
        assert_eq!(loaded.len(), expected.len());
        for (name, value) in &expected {
            assert_eq!(loaded.get(name), Some(value), "{} differs with {:?}", name, mode);
        }
    }
    Ok(())
}

#[test]
fn test_idempotent_resave() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let mut pack = mixed_pack()?;
    pack.save_to(dir.path(), &SaveOptions::new())?;
    let files = files_in(dir.path());

    pack.save(&SaveOptions::new())?;
    let mut reopened = Pack::open(dir.path(), &LoadOptions::default())?;
    reopened.save(&SaveOptions::new())?;
    drop(reopened);

    assert_eq!(files_in(dir.path()), files);
    let loaded = Pack::open(dir.path(), &LoadOptions::default().mmap_mode(None))?;
    for (name, value) in &mixed_pack()? {
        assert_eq!(loaded.get(name), Some(value), "{} changed after re-save", name);
    }
    Ok(())
}

#[test]
fn test_size_threshold_placement() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let mut pack = Pack::new();
    pack.set("small", "x")?;
    pack.set("large", "y".repeat(5000))?;
    pack.set("requested", 1)?;

    let options = SaveOptions::new()
        .sep_var_min_size(1000)
        .separate("requested")
        .separate("not_a_variable");
    let report = pack.save_to(dir.path(), &options)?;
    assert_eq!(report.separate_vars, vec!["large", "requested"]);
    assert_eq!(report.misc_vars, vec!["small"]);

    let manifest = pack.manifest().expect("manifest after save");
    assert_eq!(manifest.get("large").unwrap().filename, "large.vpk");
    assert_eq!(manifest.get("requested").unwrap().filename, "requested.vpk");
    assert_eq!(manifest.get("small").unwrap().filename, MISC_FILENAME);
    assert!(!manifest.contains("not_a_variable"));
    Ok(())
}

#[test]
fn test_placeholder_transparency() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = PackConfig {
        min_dict_array_len: 1000,
        ..PackConfig::default()
    };

    let big = Array1::<f64>::from_iter((0..5000).map(|i| i as f64 * 0.5));
    let small = Array1::<i32>::from_elem(10, 4);
    let mut dict = BTreeMap::new();
    dict.insert("big".to_string(), Value::from(big.clone()));
    dict.insert("small".to_string(), Value::from(small.clone()));

    let mut pack = Pack::with_config(config);
    pack.set("dict", Value::Mapping(dict))?;
    pack.save_to(dir.path(), &SaveOptions::new())?;

    // The live pack holds arrays again right after saving
    let live = pack.get("dict").unwrap().as_mapping().unwrap();
    assert!(!pack.get("dict").unwrap().contains_placeholders());
    assert!(matches!(live["big"], Value::Mapped(_)));

    let entry = pack.manifest().unwrap().get("dict").unwrap();
    assert!(entry.uses_placeholders());
    assert_eq!(files_in(dir.path()).len(), 3);

    let loaded = Pack::open(dir.path(), &LoadOptions::default())?;
    let map = loaded.get("dict").unwrap().as_mapping().unwrap();
    assert!(map.values().all(Value::is_array));
    assert_eq!(map["big"], Value::from(big));
    assert_eq!(map["small"], Value::from(small));
    Ok(())
}

#[test]
fn test_end_to_end_small() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let list = Value::Sequence((1..=4).map(Value::from).collect());

    let mut pack = Pack::new();
    pack.set("scalar", 10)?;
    pack.set("text", "test")?;
    pack.set("list", list.clone())?;
    pack.save_to(dir.path(), &SaveOptions::new())?;

    assert_eq!(files_in(dir.path()), vec![MISC_FILENAME, MANIFEST_FILENAME]);

    let loaded = Pack::open(dir.path(), &LoadOptions::default())?;
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded.get("scalar").and_then(Value::as_int), Some(10));
    assert_eq!(loaded.get("text").and_then(Value::as_text), Some("test"));
    assert_eq!(loaded.get("list"), Some(&list));
    Ok(())
}

#[test]
fn test_end_to_end_large_arrays() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let ramp = |n: usize, step: f64| Array1::from_iter((0..n).map(|i| i as f64 * step));
    let mut dict = BTreeMap::new();
    dict.insert("key1".to_string(), Value::from(ramp(10_000_000, 1.0)));
    dict.insert("key2".to_string(), Value::from(ramp(20_000_000, 2.0)));

    let mut pack = Pack::new();
    pack.set("scalar", 10)?;
    pack.set("text", "test")?;
    pack.set("np_arr", ramp(10_000_000, 3.0))?;
    pack.set("dict_of_np_arr", Value::Mapping(dict))?;
    pack.save_to(dir.path(), &SaveOptions::new().sep_var_min_size(1000))?;
    drop(pack);

    let manifest = varpack::Manifest::read_from(dir.path())?;
    let np_arr = manifest.get("np_arr").unwrap();
    assert_eq!(np_arr.filename, "np_arr.npy");
    assert_eq!(np_arr.shape, Some(vec![10_000_000]));
    assert!(dir.path().join("np_arr.npy").exists());

    let dict_entry = manifest.get("dict_of_np_arr").unwrap();
    assert_eq!(dict_entry.uses_placeholders, Some(true));
    assert_eq!(dict_entry.placeholder_files.len(), 2);
    assert!(dict_entry.size_before_placeholders.unwrap() > 240_000_000);

    let loaded = Pack::open(dir.path(), &LoadOptions::default())?;
    let map = loaded.get("dict_of_np_arr").unwrap().as_mapping().unwrap();
    for (key, len, step) in [("key1", 10_000_000, 1.0), ("key2", 20_000_000, 2.0)] {
        let view = map[key].as_mapped().expect("mapped array").view::<f64>()?;
        assert_eq!(view.len(), len);
        assert!(view.iter().enumerate().all(|(i, &x)| x == i as f64 * step));
    }
    let np_arr = loaded.get("np_arr").unwrap().as_mapped().unwrap().view::<f64>()?;
    assert!(np_arr.iter().enumerate().all(|(i, &x)| x == i as f64 * 3.0));
    Ok(())
}

#[test]
fn test_array_write_failure_demotes_to_object() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("weights.npy")).unwrap();

    let weights: ArrayD<f32> = Array1::<f32>::from_elem(16, 0.5).into_dyn();
    let mut pack = Pack::new();
    pack.set("weights", weights.clone())?;
    pack.set("n", 3)?;

    let report = pack.save_to(dir.path(), &SaveOptions::new())?;
    assert_eq!(report.demoted, vec!["weights"]);
    assert_eq!(pack.manifest().unwrap().get("weights").unwrap().filename, MISC_FILENAME);

    let loaded = Pack::open(dir.path(), &LoadOptions::default())?;
    assert_eq!(loaded.get("weights"), Some(&Value::from(weights)));
    Ok(())
}

#[test]
fn test_missing_manifest_fails_load() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let mut pack = Pack::new();
    let err = pack.load(dir.path(), &LoadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Manifest(_)));
    assert!(pack.attached_dir().is_none());
}

#[test]
fn test_load_without_stop_on_error_reports_failures() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let mut pack = Pack::new();
    pack.set("arr", Array1::<i64>::from_elem(4, 1))?;
    pack.set("blob", "z".repeat(100))?;
    pack.set("n", 1)?;
    pack.save_to(dir.path(), &SaveOptions::new().separate("blob"))?;
    fs::write(dir.path().join("blob.vpk"), b"corrupted").unwrap();
    fs::remove_file(dir.path().join("arr.npy")).unwrap();

    let mut loaded = Pack::new();
    let report = loaded.load(dir.path(), &LoadOptions::default().stop_on_error(false))?;
    assert!(!report.is_complete());
    assert_eq!(report.loaded, vec!["n"]);
    assert_eq!(report.skipped, vec!["arr", "blob"]);

    let failed: Vec<&str> = report.failures.iter().map(|f| f.file.as_str()).collect();
    assert_eq!(failed, vec!["arr.npy", "blob.vpk"]);
    assert!(loaded.skipped_on_load().contains("blob"));
    assert_eq!(loaded.attached_dir(), Some(dir.path()));

    let err = Pack::open(dir.path(), &LoadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Load { .. }));
    Ok(())
}

#[test]
fn test_config_file_drives_placement() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("varpack.toml");
    fs::write(&config_path, "sep_var_min_size = 10\nmmap_mode = \"none\"\n").unwrap();
    let config = PackConfig::from_file(&config_path)?;

    let pack_dir = dir.path().join("pack");
    let mut pack = Pack::with_config(config);
    pack.set("text", "long enough to be separate")?;
    let report = pack.save_to(&pack_dir, &SaveOptions::new())?;
    assert_eq!(report.separate_vars, vec!["text"]);
    assert_eq!(pack.mmap_mode(), None);
    assert!(pack_dir.join("text.vpk").exists());
    Ok(())
}

fn spill_files(dir: &Path, var: &str) -> Vec<String> {
    files_in(dir)
        .into_iter()
        .filter(|name| name.starts_with(var) && name.ends_with(".npy") && *name != format!("{}.npy", var))
        .collect()
}

#[test]
fn test_missing_spill_file_fails_load_even_without_stop_on_error() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = PackConfig {
        min_dict_array_len: 10,
        ..PackConfig::default()
    };

    let mut dict = BTreeMap::new();
    dict.insert("big".to_string(), Value::from(Array1::<f64>::zeros(100)));
    let mut pack = Pack::with_config(config);
    pack.set("dict", Value::Mapping(dict))?;
    pack.set("n", 1)?;
    pack.save_to(dir.path(), &SaveOptions::new())?;
    drop(pack);

    let spills = spill_files(dir.path(), "dict");
    assert_eq!(spills.len(), 1);
    fs::remove_file(dir.path().join(&spills[0])).unwrap();

    let mut loaded = Pack::new();
    let err = loaded
        .load(dir.path(), &LoadOptions::default().stop_on_error(false))
        .unwrap_err();
    assert!(matches!(err, Error::Placeholder { ref file, .. } if *file == spills[0]));
    assert!(loaded.is_empty());
    assert!(loaded.attached_dir().is_none());
    Ok(())
}

#[test]
fn test_spilled_copy_of_mapped_array_survives_overwrite() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = PackConfig {
        min_dict_array_len: 10,
        ..PackConfig::default()
    };

    let mut pack = Pack::with_config(config.clone());
    pack.set("np_arr", Array1::<f64>::ones(100))?;
    pack.save_to(dir.path(), &SaveOptions::new())?;
    drop(pack);

    let options = LoadOptions::default().mmap_mode(Some(MapMode::ReadWrite));
    let mut loaded = Pack::open_with_config(dir.path(), config.clone(), &options)?;
    assert_eq!(loaded.config(), &config);
    let original = loaded.get("np_arr").cloned().unwrap();
    assert!(matches!(original, Value::Mapped(_)));

    let mut backup = BTreeMap::new();
    backup.insert("orig".to_string(), original);
    loaded.set("backup", Value::Mapping(backup))?;
    loaded.set("np_arr", Array1::<f64>::from_elem(100, 2.0))?;
    loaded.save(&SaveOptions::new())?;

    let spills = spill_files(dir.path(), "backup");
    assert_eq!(spills.len(), 1);
    let live = loaded.get("backup").unwrap().as_mapping().unwrap();
    assert_eq!(live["orig"], Value::from(Array1::<f64>::ones(100)));
    drop(loaded);

    let reread = Pack::open(dir.path(), &LoadOptions::default().mmap_mode(None))?;
    let backup = reread.get("backup").unwrap().as_mapping().unwrap();
    assert_eq!(backup["orig"], Value::from(Array1::<f64>::ones(100)));
    assert_eq!(reread.get("np_arr"), Some(&Value::from(Array1::<f64>::from_elem(100, 2.0))));
    Ok(())
}
