use std::error::Error;
use std::fs;
use std::path::Path;

use approx::assert_abs_diff_eq;

use bbitrack::{BBIError, BBIRead, BigWigRead, BigWigWrite, Entries, StatType, Value};

fn chrom_sizes() -> Vec<(String, u32)> {
    vec![("1".to_string(), 1_000_000), ("2".to_string(), 1_500_000)]
}

fn intervals(chrom: &str, items: &[(u32, u32, f32)]) -> Entries {
    Entries::Intervals {
        chroms: vec![chrom.to_string(); items.len()],
        starts: items.iter().map(|i| i.0).collect(),
        ends: items.iter().map(|i| i.1).collect(),
        values: items.iter().map(|i| i.2).collect(),
    }
}

fn assert_values_eq(actual: &[Value], expected: &[(u32, u32, f32)]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert_eq!(a.start, e.0);
        assert_eq!(a.end, e.1);
        assert_abs_diff_eq!(a.value, e.2, epsilon = 1e-5);
    }
}

#[test]
fn test_explicit_intervals() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.bigWig");

    let mut out = BigWigWrite::create_file(&path, chrom_sizes())?;
    out.add_entries(intervals(
        "1",
        &[(0, 5, 0.0), (100, 120, 1.0), (125, 126, 200.0)],
    ))?;
    out.close()?;

    let mut bwread = BigWigRead::open_file(&path)?;
    let chroms = bwread.chroms()?;
    assert_eq!(chroms.len(), 2);
    assert_eq!(chroms[0].name, "1");
    assert_eq!(chroms[0].length, 1_000_000);
    assert_eq!(chroms[1].name, "2");
    assert_eq!(chroms[1].length, 1_500_000);

    let max = bwread.stats("1", Some(0), Some(126), StatType::Max, 1)?;
    assert_eq!(max, vec![Some(200.0)]);

    let values = bwread.intervals("1", Some(0), Some(126))?.unwrap();
    assert_values_eq(&values, &[(0, 5, 0.0), (100, 120, 1.0), (125, 126, 200.0)]);

    let missing = bwread.values("1", 5, 100)?;
    assert_eq!(missing.len(), 95);
    assert!(missing.iter().all(|v| v.is_nan()));

    let header = bwread.header()?;
    assert_eq!(header.bases_covered, 26);
    assert_eq!(header.min_val, 0.0);
    assert_eq!(header.max_val, 200.0);
    assert_abs_diff_eq!(header.sum_data, 20.0 + 200.0, epsilon = 1e-5);

    Ok(())
}

#[test]
fn test_fixed_step() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.bigWig");

    let mut out = BigWigWrite::create_file(&path, chrom_sizes())?;
    out.add_entries(Entries::Steps {
        chrom: "1".to_string(),
        start: 900,
        span: 20,
        step: 30,
        values: vec![-5.0, -20.0, 25.0],
    })?;
    out.close()?;

    let mut bwread = BigWigRead::open_file(&path)?;
    let values = bwread.intervals("1", Some(900), Some(1000))?.unwrap();
    assert_values_eq(&values, &[(900, 920, -5.0), (930, 950, -20.0), (960, 980, 25.0)]);

    let per_base = bwread.values("1", 915, 935)?;
    assert_eq!(per_base[..5], [-5.0; 5]);
    assert!(per_base[5..15].iter().all(|v| v.is_nan()));
    assert_eq!(per_base[15..], [-20.0; 5]);

    Ok(())
}

/// Writes the same data through all three shapes, over many small blocks.
fn write_mixed(path: &Path, compress: bool) -> Result<Vec<(u32, u32, f32)>, Box<dyn Error>> {
    let mut expected = vec![];

    let mut out = BigWigWrite::create_file(path, chrom_sizes())?;
    out.options.compress = compress;
    out.options.items_per_slot = 7;
    out.options.block_size = 4;

    let explicit: Vec<(u32, u32, f32)> = (0..100)
        .map(|i| (i * 10, i * 10 + 5, i as f32 * 0.25))
        .collect();
    out.add_entries(intervals("1", &explicit))?;
    expected.extend(explicit);

    let starts: Vec<u32> = (0..50).map(|i| 2_000 + i * i * 3).collect();
    let values: Vec<f32> = (0..50).map(|i| -(i as f32) / 3.0).collect();
    out.add_entries(Entries::Spans {
        chrom: "1".to_string(),
        starts: starts.clone(),
        span: 3,
        values: values.clone(),
    })?;
    expected.extend(starts.iter().zip(values.iter()).map(|(s, v)| (*s, s + 3, *v)));

    let values: Vec<f32> = (0..80).map(|i| (i % 9) as f32 + 0.5).collect();
    out.add_entries(Entries::Steps {
        chrom: "1".to_string(),
        start: 20_000,
        span: 5,
        step: 8,
        values: values.clone(),
    })?;
    expected.extend(
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (20_000 + i as u32 * 8, 20_000 + i as u32 * 8 + 5, *v)),
    );

    out.close()?;
    Ok(expected)
}

#[test]
fn test_round_trip_all_shapes() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    for compress in [true, false] {
        let path = dir.path().join(format!("test_{}.bigWig", compress));
        let expected = write_mixed(&path, compress)?;

        let mut bwread = BigWigRead::open_file(&path)?;
        assert_eq!(bwread.info().header.is_compressed(), compress);
        let values = bwread.intervals("1", None, None)?.unwrap();
        assert_values_eq(&values, &expected);

        // A range in the middle returns the stored, unclipped, bounds.
        let values = bwread.intervals("1", Some(13), Some(42))?.unwrap();
        assert_values_eq(&values, &[(10, 15, 0.25), (20, 25, 0.5), (30, 35, 0.75), (40, 45, 1.0)]);
    }
    Ok(())
}

#[test]
fn test_zoom_levels() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.bigWig");

    let mut out = BigWigWrite::create_file(&path, vec![("1".to_string(), 100_000)])?;
    out.add_entries(Entries::Steps {
        chrom: "1".to_string(),
        start: 0,
        span: 10,
        step: 10,
        values: (0..10_000).map(|i| (i % 100) as f32 * 0.5).collect(),
    })?;
    out.close()?;

    let mut bwread = BigWigRead::open_file(&path)?;
    let levels: Vec<u32> = bwread
        .info()
        .zoom_headers
        .iter()
        .map(|z| z.reduction_level)
        .collect();
    assert_eq!(levels, vec![40, 160, 640, 2560, 10240, 40960, 163840]);
    assert_eq!(bwread.header()?.zoom_levels, 7);

    let records = bwread.zoom_values("1", 0, 400, 160)?;
    let windows: Vec<(u32, u32)> = records.iter().map(|r| (r.start, r.end)).collect();
    assert_eq!(windows, vec![(0, 160), (160, 320), (320, 480)]);
    assert_eq!(records[0].summary.bases_covered, 160);

    let err = bwread.zoom_values("1", 0, 400, 123);
    assert!(matches!(err, Err(BBIError::ReductionLevelNotFound(123))));

    Ok(())
}

#[test]
fn test_max_zooms() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.bigWig");

    let mut out = BigWigWrite::create_file(&path, vec![("1".to_string(), 100_000)])?;
    out.options.max_zooms = 2;
    out.options.initial_zoom_size = 100;
    out.options.zoom_increment = 10;
    out.add_entries(Entries::Steps {
        chrom: "1".to_string(),
        start: 0,
        span: 1,
        step: 2,
        values: vec![1.0; 50_000],
    })?;
    out.close()?;

    let bwread = BigWigRead::open_file(&path)?;
    let levels: Vec<u32> = bwread
        .info()
        .zoom_headers
        .iter()
        .map(|z| z.reduction_level)
        .collect();
    assert_eq!(levels, vec![100, 1000]);
    Ok(())
}

#[test]
fn test_out_of_order() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;

    let valid = dir.path().join("valid.bigWig");
    let mut out = BigWigWrite::create_file(&valid, chrom_sizes())?;
    out.add_entries(intervals("1", &[(0, 10, 1.0), (10, 20, 2.0)]))?;
    out.add_entries(intervals("2", &[(5, 10, 3.0)]))?;
    out.add_entries(intervals("2", &[(50, 60, 4.0)]))?;
    out.close()?;

    let retried = dir.path().join("retried.bigWig");
    let mut out = BigWigWrite::create_file(&retried, chrom_sizes())?;
    out.add_entries(intervals("1", &[(0, 10, 1.0), (10, 20, 2.0)]))?;
    // Starts before the end of the last entry
    let err = out.add_entries(intervals("1", &[(25, 30, 9.0), (15, 30, 9.0)]));
    assert!(matches!(err, Err(BBIError::OutOfOrderEntry(_))));
    let err = out.add_entries(Entries::Spans {
        chrom: "1".to_string(),
        starts: vec![5],
        span: 1,
        values: vec![9.0],
    });
    assert!(matches!(err, Err(BBIError::OutOfOrderEntry(_))));
    out.add_entries(intervals("2", &[(5, 10, 3.0)]))?;
    // Chromosome "1" is closed now
    let err = out.add_entries(intervals("1", &[(500, 510, 9.0)]));
    assert!(matches!(err, Err(BBIError::OutOfOrderEntry(_))));
    // A batch that is partly valid is rejected whole
    let err = out.add_entries(intervals("2", &[(50, 60, 4.0), (55, 70, 9.0)]));
    assert!(matches!(err, Err(BBIError::OutOfOrderEntry(_))));
    let err = out.add_entries(Entries::Intervals {
        chroms: vec!["2".to_string(), "3".to_string()],
        starts: vec![50, 0],
        ends: vec![60, 10],
        values: vec![4.0, 9.0],
    });
    assert!(matches!(err, Err(BBIError::UnknownChromosome(_))));
    out.add_entries(intervals("2", &[(50, 60, 4.0)]))?;
    out.close()?;

    assert_eq!(fs::read(&valid)?, fs::read(&retried)?);
    Ok(())
}

#[test]
fn test_chroms_written_out_of_declaration_order() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.bigWig");

    let mut out = BigWigWrite::create_file(&path, chrom_sizes())?;
    out.add_entries(intervals("2", &[(0, 10, 2.0)]))?;
    out.add_entries(intervals("1", &[(0, 10, 1.0)]))?;
    out.close()?;

    let mut bwread = BigWigRead::open_file(&path)?;
    assert_values_eq(&bwread.intervals("1", None, None)?.unwrap(), &[(0, 10, 1.0)]);
    assert_values_eq(&bwread.intervals("2", None, None)?.unwrap(), &[(0, 10, 2.0)]);
    Ok(())
}

#[test]
fn test_invalid_entries() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.bigWig");

    let err = BigWigWrite::create_file(&path, vec![("1".to_string(), 0)]);
    assert!(matches!(err, Err(BBIError::InvalidEntry(_))));

    let mut out = BigWigWrite::create_file(&path, chrom_sizes())?;
    let err = out.add_entries(intervals("1", &[(10, 5, 1.0)]));
    assert!(matches!(err, Err(BBIError::InvalidEntry(_))));
    let err = out.add_entries(intervals("1", &[(999_990, 1_000_001, 1.0)]));
    assert!(matches!(err, Err(BBIError::InvalidEntry(_))));
    let err = out.add_entries(Entries::Spans {
        chrom: "1".to_string(),
        starts: vec![1, 2],
        span: 1,
        values: vec![1.0],
    });
    assert!(matches!(err, Err(BBIError::InvalidEntry(_))));
    let err = out.add_entries(Entries::Steps {
        chrom: "1".to_string(),
        start: 0,
        span: 1,
        step: 0,
        values: vec![1.0, 2.0],
    });
    assert!(matches!(err, Err(BBIError::InvalidEntry(_))));
    out.close()?;
    Ok(())
}

#[test]
fn test_unchecked() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.bigWig");

    let mut out = BigWigWrite::create_file(&path, chrom_sizes())?;
    out.add_entries_unchecked(intervals("1", &[(0, 10, 1.0), (20, 30, 2.0)]))?;
    let err = out.add_entries_unchecked(intervals("1", &[(25, 40, 3.0)]));
    assert!(matches!(err, Err(BBIError::OutOfOrderEntry(_))));
    let err = out.add_entries_unchecked(intervals("3", &[(25, 40, 3.0)]));
    assert!(matches!(err, Err(BBIError::UnknownChromosome(_))));
    out.add_entries_unchecked(intervals("1", &[(30, 40, 3.0)]))?;
    out.close()?;

    let mut bwread = BigWigRead::open_file(&path)?;
    assert_values_eq(
        &bwread.intervals("1", None, None)?.unwrap(),
        &[(0, 10, 1.0), (20, 30, 2.0), (30, 40, 3.0)],
    );
    Ok(())
}

#[test]
fn test_closed_writer() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.bigWig");

    let mut out = BigWigWrite::create_file(&path, chrom_sizes())?;
    out.add_entries(intervals("1", &[(0, 10, 1.0)]))?;
    out.close()?;

    let err = out.add_entries(intervals("1", &[(20, 30, 1.0)]));
    assert!(matches!(err, Err(BBIError::ClosedHandle)));
    assert!(matches!(out.close(), Err(BBIError::ClosedHandle)));
    Ok(())
}

#[test]
fn test_drop_without_close() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.bigWig");

    let mut out = BigWigWrite::create_file(&path, chrom_sizes())?;
    out.add_entries(intervals("1", &[(0, 10, 1.0)]))?;
    drop(out);

    assert!(!path.exists());
    assert_eq!(fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn test_empty_file() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.bigWig");

    let mut out = BigWigWrite::create_file(&path, chrom_sizes())?;
    out.close()?;

    let mut bwread = BigWigRead::open_file(&path)?;
    assert_eq!(bwread.chroms()?.len(), 2);
    assert!(bwread.info().zoom_headers.is_empty());
    assert_eq!(bwread.intervals("1", None, None)?, None);
    let header = bwread.header()?;
    assert_eq!(header.bases_covered, 0);
    assert_eq!(header.min_val, 0.0);
    assert_eq!(header.max_val, 0.0);
    Ok(())
}

#[test]
fn test_failed_close_keeps_previous_file() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let tracks = dir.path().join("tracks");
    fs::create_dir(&tracks)?;
    let path = tracks.join("test.bigWig");

    let mut out = BigWigWrite::create_file(&path, chrom_sizes())?;
    out.add_entries(intervals("1", &[(0, 10, 1.0)]))?;
    out.close()?;
    let original = fs::read(&path)?;

    let mut out = BigWigWrite::create_file(&path, chrom_sizes())?;
    out.add_entries(intervals("1", &[(0, 10, 5.0), (20, 30, 6.0)]))?;

    // Swap the target's directory for a plain file, so nothing can be created in it.
    let moved = dir.path().join("moved");
    fs::rename(&tracks, &moved)?;
    fs::write(&tracks, b"not a directory")?;

    assert!(matches!(out.close(), Err(BBIError::IoError(_))));
    assert!(matches!(out.close(), Err(BBIError::ClosedHandle)));

    let kept = moved.join("test.bigWig");
    assert_eq!(fs::read(&kept)?, original);
    assert_eq!(fs::read_dir(&moved)?.count(), 1);

    let mut bwread = BigWigRead::open_file(&kept)?;
    assert_values_eq(&bwread.intervals("1", None, None)?.unwrap(), &[(0, 10, 1.0)]);
    Ok(())
}
