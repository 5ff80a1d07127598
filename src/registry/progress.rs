//! `ProgressRecord` and its percent-derivation invariant.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Completed,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub status: DownloadStatus,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub percent: Option<f64>,
    pub error: Option<String>,
    pub error_code: Option<u16>,
}

impl ProgressRecord {
    pub fn queued(total: Option<u64>) -> Self {
        let mut record = Self {
            status: DownloadStatus::Queued,
            downloaded: 0,
            total,
            percent: None,
            error: None,
            error_code: None,
        };
        record.recompute_percent();
        record
    }

    /// `percent = round(100 * downloaded / total, 2)` whenever `total > 0`,
    /// else `None`.
    pub fn recompute_percent(&mut self) {
        self.percent = match self.total {
            Some(total) if total > 0 => {
                let raw = 100.0 * (self.downloaded as f64) / (total as f64);
                Some((raw * 100.0).round() / 100.0)
            }
            _ => None,
        };
    }

    pub fn set_downloaded(&mut self, downloaded: u64) {
        self.downloaded = downloaded;
        self.recompute_percent();
    }

    pub fn set_total(&mut self, total: Option<u64>) {
        self.total = total;
        self.recompute_percent();
    }

    pub fn set_status(&mut self, status: DownloadStatus) {
        self.status = status;
    }

    pub fn set_error(&mut self, message: String, code: u16) {
        self.error = Some(message);
        self.error_code = Some(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_none_without_total() {
        let record = ProgressRecord::queued(None);
        assert_eq!(record.percent, None);
    }

    #[test]
    fn percent_rounds_to_two_decimals() {
        let mut record = ProgressRecord::queued(Some(3));
        record.set_downloaded(1);
        // 100 * 1/3 = 33.333... -> 33.33
        assert_eq!(record.percent, Some(33.33));
    }

    #[test]
    fn percent_is_100_when_complete() {
        let mut record = ProgressRecord::queued(Some(16));
        record.set_downloaded(16);
        assert_eq!(record.percent, Some(100.0));
    }
}
