use crate::wire::codec::{compress, decompress};
use crate::wire::error::{WireError, WireResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const FILM_COMPRESSION: u32 = 6;
/// Largest film a slave will allocate, 4096x4096.
pub const MAX_FILM_PIXELS: u64 = 1 << 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pixel {
    pub rgb: [f32; 3],
    pub weight: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct FilmSnapshot {
    x_resolution: u32,
    y_resolution: u32,
    sample_count: f64,
    pixels: Vec<Pixel>,
}

/// Accumulation buffer receiving samples locally or merged from slaves.
#[derive(Debug, Clone, Default)]
pub struct SampleFilm {
    x_resolution: u32,
    y_resolution: u32,
    pixels: Vec<Pixel>,
    sample_count: f64,
    samples_from_network: f64,
    noise_aware_map: Option<Vec<f32>>,
    user_sampling_map: Option<Vec<f32>>,
}

impl SampleFilm {
    pub fn new(x_resolution: u32, y_resolution: u32) -> WireResult<Self> {
        let mut film = Self::default();
        film.resize(x_resolution, y_resolution)?;
        Ok(film)
    }

    /// Reconfigures the resolution and drops everything accumulated so far.
    pub fn resize(&mut self, x_resolution: u32, y_resolution: u32) -> WireResult<()> {
        let pixels = u64::from(x_resolution) * u64::from(y_resolution);
        if pixels > MAX_FILM_PIXELS {
            return Err(WireError::protocol(format!(
                "film of {}x{} exceeds {} pixels",
                x_resolution, y_resolution, MAX_FILM_PIXELS
            )));
        }
        *self = Self {
            x_resolution,
            y_resolution,
            pixels: vec![Pixel::default(); x_resolution as usize * y_resolution as usize],
            ..Self::default()
        };
        Ok(())
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.x_resolution, self.y_resolution)
    }

    pub fn pixel_count(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_configured(&self) -> bool {
        !self.pixels.is_empty()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Pixel> {
        self.index(x, y).map(|i| self.pixels[i])
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.x_resolution && y < self.y_resolution)
            .then(|| y as usize * self.x_resolution as usize + x as usize)
    }

    pub fn add_sample(&mut self, x: u32, y: u32, rgb: [f32; 3]) -> bool {
        let Some(i) = self.index(x, y) else {
            return false;
        };
        let pixel = &mut self.pixels[i];
        for (acc, value) in pixel.rgb.iter_mut().zip(rgb) {
            *acc += value;
        }
        pixel.weight += 1.0;
        self.sample_count += 1.0;
        true
    }

    pub fn sample_count(&self) -> f64 {
        self.sample_count
    }

    pub fn samples_from_network(&self) -> f64 {
        self.samples_from_network
    }

    pub fn reset_samples(&mut self) {
        self.pixels.iter_mut().for_each(|p| *p = Pixel::default());
        self.sample_count = 0.0;
    }

    pub fn snapshot_compressed(&self) -> WireResult<Vec<u8>> {
        let snapshot = FilmSnapshot {
            x_resolution: self.x_resolution,
            y_resolution: self.y_resolution,
            sample_count: self.sample_count,
            pixels: self.pixels.clone(),
        };
        compress(&bincode::serialize(&snapshot)?, FILM_COMPRESSION)
    }

    /// Adds a remote snapshot to this film and returns how many samples it carried.
    pub fn merge_compressed(&mut self, bytes: &[u8]) -> WireResult<f64> {
        let snapshot: FilmSnapshot = bincode::deserialize(&decompress(bytes)?)?;
        let expected = snapshot.x_resolution as usize * snapshot.y_resolution as usize;
        if snapshot.pixels.len() != expected {
            return Err(WireError::protocol(format!(
                "film snapshot carries {} pixels for a {}x{} film",
                snapshot.pixels.len(),
                snapshot.x_resolution,
                snapshot.y_resolution
            )));
        }

        if !self.is_configured() {
            self.resize(snapshot.x_resolution, snapshot.y_resolution)?;
        } else if self.resolution() != (snapshot.x_resolution, snapshot.y_resolution) {
            return Err(WireError::protocol(format!(
                "film resolution mismatch: local {}x{}, remote {}x{}",
                self.x_resolution, self.y_resolution, snapshot.x_resolution, snapshot.y_resolution
            )));
        }

        for (local, remote) in self.pixels.iter_mut().zip(&snapshot.pixels) {
            for (acc, value) in local.rgb.iter_mut().zip(remote.rgb) {
                *acc += value;
            }
            local.weight += remote.weight;
        }
        self.sample_count += snapshot.sample_count;
        self.samples_from_network += snapshot.sample_count;

        Ok(snapshot.sample_count)
    }

    /// Writes a resumable snapshot to `path`, returning where it actually landed.
    pub fn write_flm(&self, path: &Path) -> WireResult<PathBuf> {
        write_atomically(path, &self.snapshot_compressed()?)
    }

    pub fn read_flm(path: &Path) -> WireResult<Self> {
        let bytes = std::fs::read(path)?;
        let mut film = SampleFilm::default();
        film.merge_compressed(&bytes)?;
        film.samples_from_network = 0.0;
        Ok(film)
    }

    pub fn set_noise_aware_map(&mut self, map: Vec<f32>) -> WireResult<()> {
        self.check_map_size(&map)?;
        self.noise_aware_map = Some(map);
        Ok(())
    }

    pub fn noise_aware_map(&self) -> Option<&[f32]> {
        self.noise_aware_map.as_deref()
    }

    pub fn set_user_sampling_map(&mut self, map: Vec<f32>) -> WireResult<()> {
        self.check_map_size(&map)?;
        self.user_sampling_map = Some(map);
        Ok(())
    }

    pub fn user_sampling_map(&self) -> Option<&[f32]> {
        self.user_sampling_map.as_deref()
    }

    fn check_map_size(&self, map: &[f32]) -> WireResult<()> {
        if self.is_configured() && map.len() != self.pixel_count() {
            return Err(WireError::protocol(format!(
                "map has {} entries, film has {} pixels",
                map.len(),
                self.pixel_count()
            )));
        }
        Ok(())
    }
}

/// Writes `<path>.temp` then renames it over `path`. If the rename fails the
/// temporary file is kept and its path returned.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> WireResult<PathBuf> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".temp");
    let temp = PathBuf::from(temp);

    std::fs::write(&temp, bytes)?;
    match std::fs::rename(&temp, path) {
        Ok(()) => Ok(path.to_path_buf()),
        Err(e) => {
            tracing::warn!(
                "Failed to rename '{}' to '{}': {}",
                temp.display(),
                path.display(),
                e
            );
            Ok(temp)
        }
    }
}
