//! Landmark recordings stored as JSON lines, one frame per line. A line is
//! either an array of points or `null` for a tick without a detected pose.
//! Stands in for the live camera and pose estimator.

use std::path::Path;

use async_trait::async_trait;
use repcheck_core::{FrameSource, LandmarkFrame, LandmarkPoint, Result};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

pub struct JsonLinesSource {
    lines: Lines<BufReader<tokio::fs::File>>,
    line_number: usize,
}

impl JsonLinesSource {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_number: 0,
        })
    }
}

#[async_trait]
impl FrameSource for JsonLinesSource {
    async fn next_frame(&mut self) -> Option<LandmarkFrame> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read landmark recording");
                    return None;
                }
            };
            self.line_number += 1;

            if line.trim().is_empty() {
                continue;
            }
            return Some(
                match serde_json::from_str::<Option<Vec<LandmarkPoint>>>(&line) {
                    Ok(points) => LandmarkFrame::from_detection(points),
                    Err(err) => {
                        tracing::warn!(line = self.line_number, error = %err, "malformed landmark frame");
                        LandmarkFrame::no_pose()
                    }
                },
            );
        }
    }
}

impl std::fmt::Debug for JsonLinesSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesSource")
            .field("line_number", &self.line_number)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn reads_frames_and_gaps() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"[{{"x": 0.5, "y": 0.5, "visibility": 0.9}}]"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "null").unwrap();
        writeln!(file, "not json").unwrap();

        let mut source = JsonLinesSource::open(file.path()).await.unwrap();
        let first = source.next_frame().await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(!source.next_frame().await.unwrap().has_pose());
        assert!(!source.next_frame().await.unwrap().has_pose());
        assert!(source.next_frame().await.is_none());
    }
}
