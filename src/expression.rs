//! Expression controller: annotated speech and animation dispatch.
//!
//! Translates annotated text and animation requests into robot service calls.
//! Robot RPCs block, so non-waiting calls run on background blocking tasks;
//! the outstanding speech task is tracked so callers can ask `is_speaking`.

use crate::error::{Result, UmebotError};
use crate::robot::services::{AnimationPlayer, QianimPlayer, RobotSpeech};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// File extension of local animation files.
const ANIMATION_EXTENSION: &str = "qianim";

/// Scan `base_dir` for category subdirectories of `.qianim` files.
///
/// Categories with no animation files are skipped.
fn scan_catalogue(base_dir: &Path) -> HashMap<String, Vec<PathBuf>> {
    let mut catalogue = HashMap::new();
    let Ok(entries) = std::fs::read_dir(base_dir) else {
        return catalogue;
    };
    for entry in entries.flatten() {
        let category_path = entry.path();
        if !category_path.is_dir() {
            continue;
        }
        let Some(category) = category_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let mut files: Vec<PathBuf> = std::fs::read_dir(&category_path)
            .map(|dir| {
                dir.flatten()
                    .map(|f| f.path())
                    .filter(|p| {
                        p.extension().and_then(|e| e.to_str()) == Some(ANIMATION_EXTENSION)
                    })
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        if !files.is_empty() {
            catalogue.insert(category.to_owned(), files);
        }
    }
    catalogue
}

/// Speech and animation front-end over the robot services.
pub struct ExpressionController {
    speech: Arc<dyn RobotSpeech>,
    animation_player: Option<Arc<dyn AnimationPlayer>>,
    qianim_player: Option<Arc<dyn QianimPlayer>>,
    catalogue: HashMap<String, Vec<PathBuf>>,
    speech_task: Mutex<Option<JoinHandle<()>>>,
}

impl ExpressionController {
    /// Build the controller and scan the local-animation catalogue.
    ///
    /// Missing optional services disable that feature with one log line.
    pub fn new(
        animations_dir: &Path,
        speech: Arc<dyn RobotSpeech>,
        animation_player: Option<Arc<dyn AnimationPlayer>>,
        qianim_player: Option<Arc<dyn QianimPlayer>>,
    ) -> Self {
        let catalogue = scan_catalogue(animations_dir);
        info!(
            "animation catalogue: {} categories under {}",
            catalogue.len(),
            animations_dir.display()
        );
        if animation_player.is_none() {
            warn!("animation player unavailable, standard tags disabled");
        }
        if qianim_player.is_none() {
            warn!("local animation service unavailable, .qianim playback disabled");
        }
        Self {
            speech,
            animation_player,
            qianim_player,
            catalogue,
            speech_task: Mutex::new(None),
        }
    }

    /// Categories found in the catalogue.
    pub fn categories(&self) -> Vec<String> {
        self.catalogue.keys().cloned().collect()
    }

    /// Speak annotated text through the robot's animated speech service.
    ///
    /// With `wait`, returns after the utterance completes; otherwise the call
    /// runs in the background and `is_speaking` reports its status.
    ///
    /// # Errors
    ///
    /// Returns an error only on the waiting path when the RPC fails.
    pub async fn say(&self, annotated_text: &str, wait: bool) -> Result<()> {
        let speech = Arc::clone(&self.speech);
        let text = annotated_text.to_owned();
        let task = tokio::task::spawn_blocking(move || {
            if let Err(e) = speech.animated_say(&text) {
                warn!("animated_say failed: {e}");
            }
        });

        if wait {
            task.await
                .map_err(|e| UmebotError::Expression(format!("speech task failed: {e}")))?;
            return Ok(());
        }

        if let Ok(mut guard) = self.speech_task.lock() {
            *guard = Some(task);
        }
        Ok(())
    }

    /// Whether a background utterance is still running.
    pub fn is_speaking(&self) -> bool {
        self.speech_task
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    /// Play a `.qianim` file from `category`; picks uniformly at random when
    /// no name is given.
    ///
    /// # Errors
    ///
    /// Returns an error when the category or named file is missing. A missing
    /// player degrades silently (logged at init).
    pub async fn play_local_animation(
        &self,
        category: &str,
        name: Option<&str>,
        wait: bool,
    ) -> Result<()> {
        let Some(player) = self.qianim_player.as_ref() else {
            return Ok(());
        };
        let files = self.catalogue.get(category).ok_or_else(|| {
            UmebotError::Expression(format!("unknown animation category '{category}'"))
        })?;

        let file = match name {
            Some(name) => files
                .iter()
                .find(|path| {
                    path.file_stem().and_then(|stem| stem.to_str()) == Some(name)
                })
                .ok_or_else(|| {
                    UmebotError::Expression(format!(
                        "animation '{name}' not found in category '{category}'"
                    ))
                })?
                .clone(),
            None => files
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or_else(|| {
                    UmebotError::Expression(format!("category '{category}' is empty"))
                })?,
        };

        let player = Arc::clone(player);
        let task = tokio::task::spawn_blocking(move || {
            if let Err(e) = player.play_file(&file) {
                warn!("local animation playback failed: {e}");
            }
        });
        if wait {
            task.await
                .map_err(|e| UmebotError::Expression(format!("animation task failed: {e}")))?;
        }
        Ok(())
    }

    /// Run a tag on the robot's built-in animation player.
    ///
    /// # Errors
    ///
    /// Returns an error only on the waiting path when the task fails. A
    /// missing player degrades silently (logged at init).
    pub async fn play_standard_tag(&self, tag: &str, wait: bool) -> Result<()> {
        let Some(player) = self.animation_player.as_ref() else {
            return Ok(());
        };
        let player = Arc::clone(player);
        let tag = tag.to_owned();
        let task = tokio::task::spawn_blocking(move || {
            if let Err(e) = player.run_tag(&tag) {
                warn!("standard tag '{tag}' failed: {e}");
            }
        });
        if wait {
            task.await
                .map_err(|e| UmebotError::Expression(format!("animation task failed: {e}")))?;
        }
        Ok(())
    }

    /// Cancel the outstanding utterance and stop all robot speech.
    pub async fn stop_all(&self) {
        if let Ok(mut guard) = self.speech_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        let speech = Arc::clone(&self.speech);
        let result = tokio::task::spawn_blocking(move || speech.stop_all_speech()).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("stop_all_speech failed: {e}"),
            Err(e) => warn!("stop_all task failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSpeech {
        spoken: Mutex<Vec<String>>,
        stops: AtomicUsize,
    }

    impl RobotSpeech for FakeSpeech {
        fn animated_say(&self, annotated_text: &str) -> Result<()> {
            self.spoken.lock().unwrap().push(annotated_text.to_owned());
            Ok(())
        }
        fn stop_all_speech(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeQianim {
        played: Mutex<Vec<PathBuf>>,
    }

    impl QianimPlayer for FakeQianim {
        fn play_file(&self, path: &Path) -> Result<()> {
            self.played.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    fn animation_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let saludos = dir.path().join("saludos");
        std::fs::create_dir(&saludos).unwrap();
        std::fs::write(saludos.join("wave.qianim"), b"").unwrap();
        std::fs::write(saludos.join("bow.qianim"), b"").unwrap();
        std::fs::write(saludos.join("notes.txt"), b"").unwrap();
        dir
    }

    #[tokio::test]
    async fn say_waits_and_records() {
        let speech = Arc::new(FakeSpeech::default());
        let controller = ExpressionController::new(
            Path::new("/nonexistent"),
            Arc::clone(&speech) as Arc<dyn RobotSpeech>,
            None,
            None,
        );
        controller.say("^runTag(hello) hola", true).await.unwrap();
        assert_eq!(speech.spoken.lock().unwrap().len(), 1);
        assert!(!controller.is_speaking());
    }

    #[tokio::test]
    async fn catalogue_ignores_non_qianim_files() {
        let tree = animation_tree();
        let qianim = Arc::new(FakeQianim {
            played: Mutex::new(Vec::new()),
        });
        let controller = ExpressionController::new(
            tree.path(),
            Arc::new(FakeSpeech::default()) as Arc<dyn RobotSpeech>,
            None,
            Some(Arc::clone(&qianim) as Arc<dyn QianimPlayer>),
        );
        assert_eq!(controller.categories(), vec!["saludos".to_owned()]);

        controller
            .play_local_animation("saludos", Some("wave"), true)
            .await
            .unwrap();
        let played = qianim.played.lock().unwrap();
        assert_eq!(played.len(), 1);
        assert!(played[0].ends_with("wave.qianim"));
    }

    #[tokio::test]
    async fn random_pick_stays_inside_category() {
        let tree = animation_tree();
        let qianim = Arc::new(FakeQianim {
            played: Mutex::new(Vec::new()),
        });
        let controller = ExpressionController::new(
            tree.path(),
            Arc::new(FakeSpeech::default()) as Arc<dyn RobotSpeech>,
            None,
            Some(Arc::clone(&qianim) as Arc<dyn QianimPlayer>),
        );
        controller
            .play_local_animation("saludos", None, true)
            .await
            .unwrap();
        let played = qianim.played.lock().unwrap();
        assert!(played[0].extension().unwrap() == "qianim");
    }

    #[tokio::test]
    async fn stop_all_issues_robot_stop() {
        let speech = Arc::new(FakeSpeech::default());
        let controller = ExpressionController::new(
            Path::new("/nonexistent"),
            Arc::clone(&speech) as Arc<dyn RobotSpeech>,
            None,
            None,
        );
        controller.stop_all().await;
        assert_eq!(speech.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_category_is_an_error() {
        let tree = animation_tree();
        let controller = ExpressionController::new(
            tree.path(),
            Arc::new(FakeSpeech::default()) as Arc<dyn RobotSpeech>,
            None,
            Some(Arc::new(FakeQianim {
                played: Mutex::new(Vec::new()),
            }) as Arc<dyn QianimPlayer>),
        );
        assert!(controller
            .play_local_animation("bailes", None, true)
            .await
            .is_err());
    }
}
