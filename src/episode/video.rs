//! Trajectory recordings.
//!
//! Every N-th episode (1-based episodes 1, N+1, 2N+1, ...) with a trajectory
//! is saved as a compressed archive next to the episode log and handed to a
//! [`TrajectoryRenderer`] that turns it into a movie with the same base name.
//! An existing archive means the recording was already made (possibly by an
//! earlier run) and is never overwritten.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::types::Trajectory;
use crate::config::{EpisodeType, LoggerConfig, VideoNameTemplate};
use crate::error::Result;
use crate::stats::CumulativeStats;

pub const ARCHIVE_EXTENSION: &str = "zip";

// ---------------------------------------------------------------------------
// Renderer collaborator
// ---------------------------------------------------------------------------

/// Turns a trajectory archive into a movie.
pub trait TrajectoryRenderer: Send {
    /// Render `archive` and return the path of the produced movie.
    fn render(&self, archive: &Path, movie_format: &str) -> anyhow::Result<PathBuf>;
}

/// Keeps the archive only; no movie is produced.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveOnly;

impl TrajectoryRenderer for ArchiveOnly {
    fn render(&self, archive: &Path, _movie_format: &str) -> anyhow::Result<PathBuf> {
        Ok(archive.to_path_buf())
    }
}

/// Runs an external program as `<program> <args..> <archive> <movie>`.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandRenderer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl TrajectoryRenderer for CommandRenderer {
    fn render(&self, archive: &Path, movie_format: &str) -> anyhow::Result<PathBuf> {
        let movie = archive.with_extension(movie_format);
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(archive)
            .arg(&movie)
            .status()
            .with_context(|| format!("failed to run renderer {}", self.program.display()))?;
        if !status.success() {
            bail!("renderer {} exited with {status}", self.program.display());
        }
        Ok(movie)
    }
}

// ---------------------------------------------------------------------------
// Trigger policy
// ---------------------------------------------------------------------------

/// When and where recordings are made.
#[derive(Debug, Clone)]
pub struct VideoPolicy {
    logdir: Option<PathBuf>,
    template: Option<VideoNameTemplate>,
    interval: u64,
    movie_format: String,
}

impl VideoPolicy {
    pub fn from_config(config: &LoggerConfig) -> Result<Self> {
        Ok(Self {
            logdir: config.logdir.clone(),
            template: config.video_template()?,
            interval: config.video_interval,
            movie_format: config.movie_format.clone(),
        })
    }

    pub fn movie_format(&self) -> &str {
        &self.movie_format
    }

    /// Whether 1-based episode `episode_number` is due for a recording.
    pub fn is_due(&self, episode_number: u64) -> bool {
        self.interval > 0
            && self.template.is_some()
            && self.logdir.is_some()
            && episode_number > 0
            && (episode_number - 1) % self.interval == 0
    }

    /// Archive path for an episode that [`is_due`](Self::is_due).
    pub fn archive_path(
        &self,
        level_name: &str,
        episode_type: EpisodeType,
        stats: &CumulativeStats,
    ) -> Option<PathBuf> {
        let logdir = self.logdir.as_ref()?;
        let name = self.template.as_ref()?.render(level_name, episode_type, stats);
        Some(logdir.join(format!("{name}.{ARCHIVE_EXTENSION}")))
    }
}

// ---------------------------------------------------------------------------
// Archive format
// ---------------------------------------------------------------------------

/// Write `trajectory` as a deflate-compressed zip holding `board.json` and
/// `goals.json`.
///
/// The archive is written under a `.partial` name and renamed once complete,
/// so `path` exists only for a finished recording.
pub fn write_archive(path: &Path, trajectory: &Trajectory) -> anyhow::Result<()> {
    let partial = path.with_extension(format!("{ARCHIVE_EXTENSION}.partial"));
    let written = write_entries(&partial, trajectory).and_then(|()| {
        std::fs::rename(&partial, path)
            .with_context(|| format!("failed to move archive into {}", path.display()))
    });
    if written.is_err() {
        let _ = std::fs::remove_file(&partial);
        return written;
    }

    debug!(path = %path.display(), frames = trajectory.len(), "Wrote trajectory archive");
    Ok(())
}

fn write_entries(path: &Path, trajectory: &Trajectory) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file("board.json", options)?;
    serde_json::to_writer(&mut zip, &trajectory.board)?;
    zip.start_file("goals.json", options)?;
    serde_json::to_writer(&mut zip, &trajectory.goals)?;
    zip.finish()?;
    Ok(())
}

/// Read an archive produced by [`write_archive`].
pub fn read_archive(path: &Path) -> anyhow::Result<Trajectory> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut zip = ZipArchive::new(BufReader::new(file))?;
    let board = serde_json::from_reader(zip.by_name("board.json")?)?;
    let goals = serde_json::from_reader(zip.by_name("goals.json")?)?;
    Ok(Trajectory { board, goals })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(interval: u64, logdir: Option<&Path>) -> VideoPolicy {
        let mut config = LoggerConfig::default().with_video(Some("ep-{training_episodes}"), interval);
        config.logdir = logdir.map(Path::to_path_buf);
        VideoPolicy::from_config(&config).unwrap()
    }

    #[test]
    fn due_every_nth_episode_starting_at_first() {
        let policy = policy(3, Some(Path::new("/runs/a")));
        let due: Vec<u64> = (1..=10).filter(|n| policy.is_due(*n)).collect();
        assert_eq!(due, vec![1, 4, 7, 10]);
    }

    #[test]
    fn never_due_without_interval_or_logdir() {
        assert!(!policy(0, Some(Path::new("/runs/a"))).is_due(1));
        assert!(!policy(1, None).is_due(1));
    }

    #[test]
    fn archive_path_uses_template() {
        let policy = policy(1, Some(Path::new("/runs/a")));
        let mut stats = CumulativeStats::new();
        stats.increment("training_episodes", 4);
        let path = policy
            .archive_path("lvl", EpisodeType::Training, &stats)
            .unwrap();
        assert_eq!(path, Path::new("/runs/a/ep-4.zip"));
    }

    #[test]
    fn archive_preserves_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traj.zip");
        let mut trajectory = Trajectory::new();
        trajectory.push(vec![vec![1, 2], vec![3, 4]], vec![vec![0, 0], vec![0, 9]]);
        trajectory.push(vec![vec![2, 2], vec![3, 4]], vec![vec![0, 0], vec![0, 9]]);

        write_archive(&path, &trajectory).unwrap();
        assert_eq!(read_archive(&path).unwrap(), trajectory);
    }

    #[test]
    fn failed_archive_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        // The final name is taken by a directory, so the archive cannot land.
        let path = dir.path().join("traj.zip");
        std::fs::create_dir(&path).unwrap();
        let mut trajectory = Trajectory::new();
        trajectory.push(vec![vec![1]], vec![vec![0]]);

        assert!(write_archive(&path, &trajectory).is_err());
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["traj.zip".to_string()]);
        assert!(path.is_dir());
    }

    #[test]
    fn command_renderer_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("x.zip");
        let err = CommandRenderer::new("/nonexistent/renderer")
            .render(&archive, "mp4")
            .unwrap_err();
        assert!(err.to_string().contains("renderer"));
    }
}
