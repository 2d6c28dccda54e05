//! Shared fixtures: a SQLite database in a temp dir and `sh` runner scripts.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use stemforge::config::AppConfig;
use stemforge::database::repositories::Repositories;
use stemforge::database::{DbPool, init_pool, run_migrations};
use stemforge::events::BroadcastEventBus;
use stemforge::pipeline::PipelineManager;
use stemforge::source::SourceLocator;
use tempfile::TempDir;

/// Prints its result as a bare object, like the real downloader.
pub const DOWNLOAD_OK: &str = r#"
out_dir="$4"
name="$6"
fmt="$8"
mkdir -p "$out_dir"
printf 'audio' > "$out_dir/$name.$fmt"
echo '{"type":"progress","percent":50,"message":"Downloading"}'
echo '{"status":"downloading"}' >&2
printf '{"path": "%s", "size": 5, "metadata": {"title": "Song"}}\n' "$out_dir/$name.$fmt"
"#;

pub const SEPARATE_OK: &str = r#"
out="$5"
mkdir -p "$out"
for stem in vocals drums bass other; do printf 'stem' > "$out/$stem.wav"; done
echo '{"type":"progress","percent":10,"message":"Loading model"}'
echo '{"type":"progress","percent":90}'
printf '{"type":"result","stems":{"vocals":"%s/vocals.wav","drums":"%s/drums.wav","bass":"%s/bass.wav","other":"%s/other.wav"},"output_dir":"%s"}\n' "$out" "$out" "$out" "$out" "$out"
"#;

pub const SEPARATE_FAIL: &str = r#"
echo '{"type":"progress","percent":40}'
echo '{"type":"error","message":"CUDA out of memory"}'
exit 1
"#;

pub const ANALYZE_OK: &str = r#"
printf '{"type":"result","tempo":120.5,"key":"C major","features":"%s"}\n' "$3"
"#;

pub const SLEEP_FOREVER: &str = "sleep 30\n";

pub const SPOTIFY_URL: &str = "https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC";

pub struct TestEnv {
    pub dir: TempDir,
    pub pool: DbPool,
    pub config: AppConfig,
    pub events: BroadcastEventBus,
}

impl TestEnv {
    /// Fresh database and directories, with runner scripts that succeed.
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("stemforge.db");
        let pool = init_pool(&format!("sqlite:{}?mode=rwc", db_path.display()))
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();

        let scripts = dir.path().join("scripts");
        std::fs::create_dir_all(&scripts).unwrap();

        let mut config = AppConfig::default();
        config.sidecar.runtime = "sh".into();
        config.sidecar.scripts_dir = scripts;
        config.sidecar.download_script = "download.sh".into();
        config.sidecar.separation_script = "separate.sh".into();
        config.sidecar.analysis_script = "analyze.sh".into();
        config.storage.downloads_dir = dir.path().join("downloads");
        config.storage.stems_dir = dir.path().join("stems");
        config.retry.use_jitter = false;

        let env = Self {
            dir,
            pool,
            config,
            events: BroadcastEventBus::new(),
        };
        env.script("download.sh", DOWNLOAD_OK);
        env.script("separate.sh", SEPARATE_OK);
        env.script("analyze.sh", ANALYZE_OK);
        env
    }

    pub fn script(&self, name: &str, body: &str) {
        std::fs::write(self.config.sidecar.scripts_dir.join(name), body).unwrap();
    }

    pub fn repositories(&self) -> Repositories {
        Repositories::sqlite(self.pool.clone())
    }

    pub fn manager(&self) -> PipelineManager {
        PipelineManager::new(
            self.config.clone(),
            self.repositories(),
            Arc::new(self.events.clone()),
        )
    }

    pub fn manager_with_locator(&self, locator: Arc<dyn SourceLocator>) -> PipelineManager {
        PipelineManager::with_locator(
            self.config.clone(),
            self.repositories(),
            Arc::new(self.events.clone()),
            locator,
        )
    }

    /// Write a fake audio file and return its path.
    pub fn audio_file(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(format!("{name}.mp3"));
        std::fs::write(&path, b"audio").unwrap();
        path
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
