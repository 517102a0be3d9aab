//! Disposition detection for local files.
//!
//! The file name is consulted first; when it says nothing definite the
//! leading bytes are sniffed.

use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::debug;

use ts_common::DataDisposition;

use crate::error::Result;

/// Bytes read from the head of a file when sniffing.
const SNIFF_LENGTH: usize = 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const TAR_MAGIC: &[u8] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;

/// Detect disposition from the file name alone.
pub fn detect_from_name(path: &str) -> Option<DataDisposition> {
    let lower = path.to_lowercase();

    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        // Inflated first, then unpacked as a tarball
        Some(DataDisposition::Gzip)
    } else if lower.ends_with(".gz") {
        Some(DataDisposition::Gzip)
    } else if lower.ends_with(".tar") {
        Some(DataDisposition::Tarball)
    } else if lower.ends_with(".nc") || lower.ends_with(".nc4") || lower.ends_with(".netcdf") {
        Some(DataDisposition::NetcdfGridded)
    } else if lower.ends_with(".fi") {
        Some(DataDisposition::XmlFiTimeseries)
    } else {
        None
    }
}

/// Detect disposition from the first bytes of a file.
pub fn detect_from_bytes(head: &[u8]) -> DataDisposition {
    if head.len() < 4 {
        return DataDisposition::Unknown;
    }

    if head.starts_with(&GZIP_MAGIC) {
        return DataDisposition::Gzip;
    }
    if head
        .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len())
        .is_some_and(|magic| magic == TAR_MAGIC)
    {
        return DataDisposition::Tarball;
    }
    if head.starts_with(b"CDF\x01") || head.starts_with(b"CDF\x02") || head.starts_with(b"\x89HDF")
    {
        return DataDisposition::NetcdfGridded;
    }

    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();

    if trimmed.starts_with('<') {
        if text.contains("fews/PI") && text.contains("<TimeSeries") {
            return DataDisposition::XmlPiTimeseries;
        }
        return DataDisposition::Unknown;
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return detect_json(&text);
    }

    if is_wres_csv(&text) {
        return DataDisposition::CsvWres;
    }
    if is_datacard(&text) {
        return DataDisposition::Datacard;
    }

    DataDisposition::Unknown
}

fn detect_json(text: &str) -> DataDisposition {
    if text.contains("org.cuahsi.waterml") {
        DataDisposition::JsonWaterml
    } else if !text.contains("\"threshold") && text.contains("wrds") && text.contains("nwm") {
        DataDisposition::JsonWrdsNwm
    } else if text.contains("\"header\":") {
        DataDisposition::JsonWrdsAhps
    } else {
        DataDisposition::Unknown
    }
}

fn is_wres_csv(text: &str) -> bool {
    const REQUIRED: [&str; 5] = [
        "value_date",
        "variable_name",
        "location",
        "measurement_unit",
        "value",
    ];

    let Some(header) = text.lines().next() else {
        return false;
    };
    let columns: Vec<&str> = header.split(',').map(|c| c.trim().trim_matches('"')).collect();
    REQUIRED.iter().all(|required| columns.contains(required))
}

/// Datacard files open with `$` comments, then a free-form header line, then a
/// line carrying the first and last month and year of the period.
fn is_datacard(text: &str) -> bool {
    let Some(line) = text.lines().filter(|l| !l.starts_with('$')).nth(1) else {
        return false;
    };
    let line = line.trim_end();
    if !(25..=32).contains(&line.len()) || !line.is_ascii() {
        return false;
    }

    let numeric = |range: std::ops::Range<usize>| {
        line.get(range)
            .map(str::trim)
            .is_some_and(|s| !s.is_empty() && s.parse::<u32>().is_ok())
    };
    numeric(0..2) && numeric(4..8) && numeric(9..12) && numeric(14..18)
}

/// Detect the disposition of a local file, by name and then by content.
pub async fn detect_disposition(path: &Path) -> Result<DataDisposition> {
    if let Some(disposition) = path.to_str().and_then(detect_from_name) {
        return Ok(disposition);
    }

    let mut file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SNIFF_LENGTH);
    (&mut file).take(SNIFF_LENGTH as u64).read_to_end(&mut head).await?;

    let disposition = detect_from_bytes(&head);
    debug!(path = %path.display(), %disposition, "Detected disposition from content");
    Ok(disposition)
}

/// Extract the forecast hour of a gridded file from its name.
///
/// Supports patterns:
/// - `_f###` (e.g., `nwm.t00z.medium_range.channel_rt_f003.conus.nc`)
/// - `z_f###` at the end of the stem
pub fn extract_forecast_hour(file_path: &str) -> Option<u32> {
    let filename = Path::new(file_path).file_name().and_then(|s| s.to_str())?;

    // Pattern: _f### anywhere in the name
    if let Some(pos) = filename.rfind("_f") {
        let rest = &filename[pos + 2..];
        if let Some(hour) = rest.get(..3).and_then(|s| s.parse::<u32>().ok()) {
            return Some(hour);
        }
    }

    let stem = Path::new(file_path).file_stem().and_then(|s| s.to_str())?;
    if let Some(pos) = stem.find("z_f") {
        if let Ok(hour) = stem[pos + 3..].parse::<u32>() {
            return Some(hour);
        }
    }

    None
}

/// Forecast lead of a gridded file in minutes.
pub fn extract_lead_minutes(file_path: &str) -> Option<i32> {
    extract_forecast_hour(file_path)
        .and_then(|hours| i32::try_from(hours).ok())
        .and_then(|hours| hours.checked_mul(60))
}
