use super::film::{SampleFilm, write_atomically};
use crate::context::RenderTarget;
use crate::wire::commands::SceneCommand;
use anyhow::anyhow;
use std::path::{Path, PathBuf};

const DEFAULT_X_RESOLUTION: u32 = 800;
const DEFAULT_Y_RESOLUTION: u32 = 600;

/// Records the scene it is fed and accumulates samples into a `SampleFilm`.
#[derive(Debug, Default)]
pub struct SceneRecorder {
    commands: Vec<SceneCommand>,
    film: SampleFilm,
    has_camera: bool,
    rendering: bool,
}

impl SceneRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[SceneCommand] {
        &self.commands
    }

    pub fn command_names(&self) -> Vec<&str> {
        self.commands.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn film(&self) -> &SampleFilm {
        &self.film
    }

    pub fn film_mut(&mut self) -> &mut SampleFilm {
        &mut self.film
    }
}

impl RenderTarget for SceneRecorder {
    fn apply(&mut self, command: SceneCommand) -> anyhow::Result<()> {
        match command.name.as_str() {
            "luxFilm" => {
                let params = command.args.params();
                let x = params
                    .and_then(|p| p.find_one_int("xresolution"))
                    .map_or(DEFAULT_X_RESOLUTION, |v| v.max(1) as u32);
                let y = params
                    .and_then(|p| p.find_one_int("yresolution"))
                    .map_or(DEFAULT_Y_RESOLUTION, |v| v.max(1) as u32);
                self.film.resize(x, y)?;
            }
            "luxCamera" => self.has_camera = true,
            "luxWorldEnd" => {
                if !self.has_camera {
                    return Err(anyhow!("scene has no camera, unable to render"));
                }
                if !self.film.is_configured() {
                    self.film.resize(DEFAULT_X_RESOLUTION, DEFAULT_Y_RESOLUTION)?;
                }
                self.rendering = true;
            }
            _ => {}
        }
        self.commands.push(command);
        Ok(())
    }

    fn is_rendering(&self) -> bool {
        self.rendering
    }

    fn film_snapshot(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.film.snapshot_compressed()?)
    }

    fn reset_film(&mut self) {
        self.film.reset_samples();
    }

    fn merge_film(&mut self, compressed: &[u8]) -> anyhow::Result<f64> {
        Ok(self.film.merge_compressed(compressed)?)
    }

    fn write_resume_film(&mut self, path: &Path) -> anyhow::Result<PathBuf> {
        Ok(write_atomically(path, &self.film.snapshot_compressed()?)?)
    }

    fn set_noise_aware_map(&mut self, map: Vec<f32>) -> anyhow::Result<()> {
        Ok(self.film.set_noise_aware_map(map)?)
    }

    fn set_user_sampling_map(&mut self, map: Vec<f32>) -> anyhow::Result<()> {
        Ok(self.film.set_user_sampling_map(map)?)
    }

    fn abort(&mut self) {
        *self = Self::default();
    }
}
