use std::error::Error;
use std::fs;
use std::path::Path;

use approx::assert_abs_diff_eq;

use bbitrack::utils::reopen::Reopen;
use bbitrack::{BBIError, BBIRead, BigWigRead, BigWigWrite, Entries, GenericBBIRead, StatType};

const LENGTH: u32 = 100_000;

/// A bigWig with every base of "1" covered by a 10 base step, and an empty "2".
fn write_dense(path: &Path) -> Result<(), Box<dyn Error>> {
    let chroms = vec![("1".to_string(), LENGTH), ("2".to_string(), 50_000)];
    let mut out = BigWigWrite::create_file(path, chroms)?;
    out.add_entries(Entries::Steps {
        chrom: "1".to_string(),
        start: 0,
        span: 10,
        step: 10,
        values: (0..LENGTH / 10).map(|i| (i % 100) as f32 * 0.5).collect(),
    })?;
    out.close()?;
    Ok(())
}

const ALL_STATS: [StatType; 6] = [
    StatType::Mean,
    StatType::Min,
    StatType::Max,
    StatType::Sum,
    StatType::Coverage,
    StatType::Std,
];

#[test]
fn test_stats_from_zooms() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dense.bigWig");
    write_dense(&path)?;

    let mut bwread = BigWigRead::open_file(&path)?;
    assert!(!bwread.info().zoom_headers.is_empty());

    for stat in ALL_STATS {
        let approx = bwread.stats("1", None, None, stat, 10)?;
        let exact = bwread.stats_exact("1", None, None, stat, 10)?;
        assert_eq!(approx.len(), 10);
        for (a, e) in approx.iter().zip(exact.iter()) {
            assert_abs_diff_eq!(a.unwrap(), e.unwrap(), epsilon = 1e-5);
        }

        let approx = bwread.stats("1", None, None, stat, 1)?;
        let exact = bwread.stats_exact("1", None, None, stat, 1)?;
        assert_abs_diff_eq!(approx[0].unwrap(), exact[0].unwrap(), epsilon = 1e-5);
    }

    // Ten full cycles of 0.0, 0.5, ..., 49.5 per bin
    let mean = bwread.stats("1", None, None, StatType::Mean, 10)?;
    for m in mean {
        assert_abs_diff_eq!(m.unwrap(), 24.75, epsilon = 1e-5);
    }
    let max = bwread.stats("1", Some(0), Some(1000), StatType::Max, 1)?;
    assert_eq!(max, vec![Some(49.5)]);
    let coverage = bwread.stats("1", None, None, StatType::Coverage, 1)?;
    assert_eq!(coverage, vec![Some(1.0)]);

    Ok(())
}

#[test]
fn test_stats_partial_bins() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dense.bigWig");
    write_dense(&path)?;

    let mut bwread = BigWigRead::open_file(&path)?;
    // [5, 25) covers half of the 0.0 step and half of the 0.5 step.
    let mean = bwread.stats("1", Some(5), Some(25), StatType::Mean, 1)?;
    assert_abs_diff_eq!(mean[0].unwrap(), (5.0 * 0.0 + 10.0 * 0.5 + 5.0 * 1.0) / 20.0, epsilon = 1e-5);
    let sum = bwread.stats("1", Some(5), Some(25), StatType::Sum, 2)?;
    assert_abs_diff_eq!(sum[0].unwrap(), 2.5, epsilon = 1e-5);
    assert_abs_diff_eq!(sum[1].unwrap(), 2.5 + 5.0, epsilon = 1e-5);
    let std = bwread.stats("1", Some(0), Some(20), StatType::Std, 1)?;
    // Ten bases of 0.0 and ten of 0.5
    let expected = ((10.0 * 0.25 - 25.0 / 20.0) / 19.0f64).sqrt();
    assert_abs_diff_eq!(std[0].unwrap(), expected, epsilon = 1e-5);
    Ok(())
}

#[test]
fn test_bins_match_single_queries() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dense.bigWig");
    write_dense(&path)?;

    let mut bwread = BigWigRead::open_file(&path)?;
    let (start, end, n_bins) = (13, 99_991, 7);
    let width = (end - start) / n_bins;
    for stat in ALL_STATS {
        let binned = bwread.stats("1", Some(start), Some(end), stat, n_bins)?;
        assert_eq!(binned.len(), n_bins as usize);
        for (i, value) in binned.into_iter().enumerate() {
            let bin_start = start + i as u32 * width;
            let bin_end = if i as u32 == n_bins - 1 {
                end
            } else {
                bin_start + width
            };
            let single = bwread.stats("1", Some(bin_start), Some(bin_end), stat, 1)?;
            assert_eq!(single, vec![value]);
        }
    }
    Ok(())
}

#[test]
fn test_empty_range() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dense.bigWig");
    write_dense(&path)?;

    let mut bwread = BigWigRead::open_file(&path)?;
    for stat in [StatType::Mean, StatType::Min, StatType::Max, StatType::Std] {
        assert_eq!(bwread.stats("2", None, None, stat, 3)?, vec![None; 3]);
        assert_eq!(bwread.stats_exact("2", None, None, stat, 3)?, vec![None; 3]);
    }
    assert_eq!(bwread.stats("2", None, None, StatType::Sum, 2)?, vec![Some(0.0); 2]);
    assert_eq!(
        bwread.stats("2", Some(100), Some(200), StatType::Coverage, 1)?,
        vec![Some(0.0)]
    );
    assert_eq!(bwread.intervals("2", None, None)?, None);
    assert!(bwread.values("2", 0, 10)?.iter().all(|v| v.is_nan()));
    Ok(())
}

#[test]
fn test_reopen_is_consistent() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dense.bigWig");
    write_dense(&path)?;

    let mut first = BigWigRead::open_file(&path)?;
    let mut second = BigWigRead::open_file(&path)?.cached()?;
    assert_eq!(first.chroms()?, second.chroms()?);
    assert_eq!(first.header()?, second.header()?);
    assert_eq!(
        first.intervals("1", Some(1234), Some(5678))?,
        second.intervals("1", Some(1234), Some(5678))?
    );
    // The same query twice on one handle
    let once = first.stats("1", Some(77), Some(88_888), StatType::Std, 5)?;
    let twice = first.stats("1", Some(77), Some(88_888), StatType::Std, 5)?;
    assert_eq!(once, twice);
    assert_eq!(once, second.stats("1", Some(77), Some(88_888), StatType::Std, 5)?);

    // A reopened handle is independent of the one it came from
    let mut third = first.reopen()?;
    first.close();
    assert_eq!(once, third.stats("1", Some(77), Some(88_888), StatType::Std, 5)?);
    Ok(())
}

#[test]
fn test_query_errors() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dense.bigWig");
    write_dense(&path)?;

    let mut bwread = BigWigRead::open_file(&path)?;
    assert!(matches!(
        bwread.stats("chrX", None, None, StatType::Mean, 1),
        Err(BBIError::UnknownChromosome(_))
    ));
    assert!(matches!(
        bwread.intervals("chrX", None, None),
        Err(BBIError::UnknownChromosome(_))
    ));
    assert!(matches!(
        bwread.stats("1", Some(10), Some(10), StatType::Mean, 1),
        Err(BBIError::InvalidQueryRange { .. })
    ));
    assert!(matches!(
        bwread.intervals("1", Some(0), Some(LENGTH + 1)),
        Err(BBIError::InvalidQueryRange { .. })
    ));
    assert!(matches!(
        bwread.values("1", 20, 10),
        Err(BBIError::InvalidQueryRange { .. })
    ));
    assert!(matches!(
        bwread.stats("1", Some(0), Some(5), StatType::Mean, 6),
        Err(BBIError::InvalidQueryRange { .. })
    ));
    // Zero bins is treated as one
    assert_eq!(bwread.stats("1", Some(0), Some(5), StatType::Mean, 0)?.len(), 1);
    Ok(())
}

#[test]
fn test_closed_reader() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dense.bigWig");
    write_dense(&path)?;

    let mut bwread = BigWigRead::open_file(&path)?;
    bwread.close();
    assert!(bwread.is_closed());
    assert!(matches!(
        bwread.intervals("1", None, None),
        Err(BBIError::ClosedHandle)
    ));
    assert!(matches!(
        bwread.stats("1", None, None, StatType::Mean, 1),
        Err(BBIError::ClosedHandle)
    ));
    assert!(matches!(bwread.header(), Err(BBIError::ClosedHandle)));
    assert!(matches!(bwread.chroms(), Err(BBIError::ClosedHandle)));
    assert!(matches!(bwread.chrom("1"), Err(BBIError::ClosedHandle)));
    // Closing twice is harmless
    bwread.close();
    Ok(())
}

#[test]
fn test_bad_files() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;

    let garbage = dir.path().join("garbage.bigWig");
    fs::write(&garbage, vec![0xABu8; 200])?;
    assert!(matches!(
        BigWigRead::open_file(&garbage),
        Err(BBIError::MalformedFile(_))
    ));

    let valid = dir.path().join("dense.bigWig");
    write_dense(&valid)?;
    let bytes = fs::read(&valid)?;

    let truncated = dir.path().join("truncated.bigWig");
    fs::write(&truncated, &bytes[..30])?;
    assert!(matches!(
        BigWigRead::open_file(&truncated),
        Err(BBIError::MalformedFile(_))
    ));

    // Files are written in native byte order
    let mut future = bytes.clone();
    future[4..6].copy_from_slice(&5u16.to_ne_bytes());
    let future_path = dir.path().join("future.bigWig");
    fs::write(&future_path, &future)?;
    assert!(matches!(
        BigWigRead::open_file(&future_path),
        Err(BBIError::UnsupportedFormatVersion(5))
    ));

    assert!(matches!(
        BigWigRead::open_file(dir.path().join("missing.bigWig")),
        Err(BBIError::IoError(_))
    ));
    Ok(())
}

#[test]
fn test_inverted_interval_is_malformed() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("inverted.bigWig");

    let mut out = BigWigWrite::create_file(&path, vec![("1".to_string(), 1_000)])?;
    out.add_entries_unchecked(Entries::Intervals {
        chroms: vec!["1".to_string()],
        starts: vec![50],
        ends: vec![40],
        values: vec![1.0],
    })?;
    out.close()?;

    let mut bwread = BigWigRead::open_file(&path)?;
    assert!(matches!(
        bwread.values("1", 0, 100),
        Err(BBIError::MalformedFile(_))
    ));
    assert!(matches!(
        bwread.stats_exact("1", Some(0), Some(100), StatType::Mean, 1),
        Err(BBIError::MalformedFile(_))
    ));
    assert!(matches!(
        bwread.intervals("1", None, None),
        Err(BBIError::MalformedFile(_))
    ));
    Ok(())
}

#[test]
fn test_generic_open() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dense.bigWig");
    write_dense(&path)?;

    let generic = GenericBBIRead::open_file(path.to_str().unwrap())?;
    assert!(generic.bigbed().is_none());
    let generic = GenericBBIRead::open_file(path.to_str().unwrap())?;
    let mut bwread = generic.bigwig().unwrap();
    assert_eq!(bwread.header()?.version, 4);
    assert_eq!(bwread.values("1", 10, 12)?, vec![0.5, 0.5]);
    Ok(())
}
