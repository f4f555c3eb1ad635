//! PGS-to-SRT conversion for the helper worker pool.
//!
//! Every toolchain failure is folded into the response's `error` field so
//! the requesting encode worker sees an orderly failure instead of a lost
//! message.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use recodex_config::WorkerConfig;
use recodex_media::ExternalCommand;
use recodex_model::{TaskPgs, TaskPgsResponse};

use crate::client::Manager;
use crate::errors::WorkerError;

/// Alias table from container language tags to tesseract trained-data
/// codes; unknown tags pass through unchanged.
pub fn tesseract_language(language: &str) -> &str {
    match language {
        "ger" | "ge" | "de" => "deu",
        "en" | "uk" => "eng",
        "es" | "esp" => "spa",
        "fre" => "fra",
        "chi" => "chi_tra",
        other => other,
    }
}

pub struct PgsConverter {
    config: WorkerConfig,
    temp_root: PathBuf,
    manager: Arc<dyn Manager>,
}

impl std::fmt::Debug for PgsConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgsConverter")
            .field("temp_root", &self.temp_root)
            .finish_non_exhaustive()
    }
}

impl PgsConverter {
    pub fn new(config: WorkerConfig, temp_root: PathBuf, manager: Arc<dyn Manager>) -> Self {
        Self {
            config,
            temp_root,
            manager,
        }
    }

    /// Convert one track and always answer the `reply_to` queue.
    pub async fn execute(&self, task: TaskPgs, cancel: CancellationToken) {
        info!(job = %task.id, stream = task.pgs_id, language = %task.language, "converting PGS to SRT");
        let result = self.convert(&task, &cancel).await;

        let response = match result {
            Ok(srt) => {
                info!(job = %task.id, stream = task.pgs_id, bytes = srt.len(), "PGS conversion done");
                TaskPgsResponse {
                    id: task.id,
                    pgs_id: task.pgs_id,
                    srt,
                    error: String::new(),
                    queue: task.reply_to.clone(),
                }
            }
            Err(err) => {
                warn!(job = %task.id, stream = task.pgs_id, error = %err, "PGS conversion failed");
                TaskPgsResponse {
                    id: task.id,
                    pgs_id: task.pgs_id,
                    srt: Vec::new(),
                    error: err.to_string(),
                    queue: task.reply_to.clone(),
                }
            }
        };
        self.manager.respond_pgs(response).await;
    }

    async fn convert(
        &self,
        task: &TaskPgs,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, WorkerError> {
        let work_dir = self.temp_root.join(format!("{}-{}", task.id, task.pgs_id));
        tokio::fs::create_dir_all(&work_dir).await?;

        let input = work_dir.join(format!("{}.sup", task.pgs_id));
        let output = work_dir.join(format!("{}.srt", task.pgs_id));
        tokio::fs::write(&input, &task.pgs_data).await?;

        let language = tesseract_language(&task.language);
        let result = ExternalCommand::new(&self.config.dotnet_path)
            .arg(self.config.pgs_to_srt_dll_path.display().to_string())
            .arg("--input")
            .arg(input.display().to_string())
            .arg("--output")
            .arg(output.display().to_string())
            .arg("--tesseractlanguage")
            .arg(language)
            .arg("--tesseractdata")
            .arg(self.config.tesseract_data_path.display().to_string())
            .work_dir(&work_dir)
            .run(cancel)
            .await;

        let srt = match result {
            Ok(_) => tokio::fs::read(&output).await.map_err(WorkerError::from),
            Err(err) => Err(err.into()),
        };

        if let Err(err) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!(job = %task.id, stream = task.pgs_id, error = %err, "conversion workspace cleanup failed");
        }
        srt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_aliases_resolve() {
        assert_eq!(tesseract_language("ger"), "deu");
        assert_eq!(tesseract_language("de"), "deu");
        assert_eq!(tesseract_language("en"), "eng");
        assert_eq!(tesseract_language("uk"), "eng");
        assert_eq!(tesseract_language("esp"), "spa");
        assert_eq!(tesseract_language("fre"), "fra");
        assert_eq!(tesseract_language("chi"), "chi_tra");
        assert_eq!(tesseract_language("jpn"), "jpn");
    }
}
