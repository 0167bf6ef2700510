use crate::error::EngineError;
use crossbeam_channel::{Receiver, Sender};
use futures::task::SpawnExt;
use std::path::{Path, PathBuf};

/// A decoded image, or why it could not be decoded.
pub type Decoded = Result<image::RgbaImage, EngineError>;

pub struct LoadResult {
    pub path: PathBuf,
    pub image: Decoded,
}

/// Decodes particle images off the frame thread. Only the newest request is
/// ever delivered; older ones finish in the background and are dropped.
pub struct ImageLoader {
    pool: futures::executor::ThreadPool,
    sender: Sender<(u64, LoadResult)>,
    receiver: Receiver<(u64, LoadResult)>,
    generation: u64,
}

pub fn decode(path: &Path) -> Decoded {
    let image = image::open(path).map_err(|source| EngineError::ImageLoad {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(image.into_rgba8())
}

impl ImageLoader {
    pub fn new() -> Result<Self, EngineError> {
        let pool = futures::executor::ThreadPool::builder()
            .pool_size(1)
            .name_prefix("image-loader-")
            .create()?;
        let (sender, receiver) = crossbeam_channel::unbounded();
        Ok(ImageLoader {
            pool,
            sender,
            receiver,
            generation: 0,
        })
    }

    pub fn request(&mut self, path: &Path) {
        self.generation += 1;
        let generation = self.generation;
        let sender = self.sender.clone();
        let path = path.to_path_buf();
        log::info!("Loading particle image {:?}", path);
        let task = async move {
            let image = decode(&path);
            // The receiver is gone once the engine is destroyed.
            let _ = sender.send((generation, LoadResult { path, image }));
        };
        if let Err(e) = self.pool.spawn(task) {
            log::error!("Failed to spawn image load: {:?}", e);
        }
    }

    /// Forgets any outstanding request.
    pub fn cancel(&mut self) {
        self.generation += 1;
    }

    pub fn poll(&self) -> Option<LoadResult> {
        self.receiver
            .try_iter()
            .filter(|(generation, _)| *generation == self.generation)
            .last()
            .map(|(_, result)| result)
    }

    /// Blocks until the current request finishes or `timeout` passes.
    pub fn wait(&self, timeout: std::time::Duration) -> Option<LoadResult> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.receiver.recv_deadline(deadline) {
                Ok((generation, result)) if generation == self.generation => {
                    return Some(result)
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// The sprite texture sampled by the image shape.
pub struct ParticleImage {
    texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl ParticleImage {
    pub fn upload(device: &wgpu::Device, queue: &wgpu::Queue, image: &image::RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        let texture_extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            size: texture_extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            label: Some("Particle image"),
        });

        let nonzero_width = std::num::NonZeroU32::new(4 * width);
        if let Some(nonzero_width) = nonzero_width {
            let data_layout = wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(nonzero_width),
                rows_per_image: None,
            };
            queue.write_texture(
                texture.as_image_copy(),
                image.as_raw(),
                data_layout,
                texture_extent,
            );
        }
        log::info!("Uploaded particle image ({}, {})", width, height);
        ParticleImage {
            view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
            texture,
            width,
            height,
        }
    }

    /// Bound when no image is set so the layout stays complete.
    pub fn placeholder(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        let white = image::RgbaImage::from_pixel(1, 1, image::Rgba([255, 255, 255, 255]));
        ParticleImage::upload(device, queue, &white)
    }

    pub fn destroy(&self) {
        self.texture.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_png(name: &str, size: u32) -> PathBuf {
        let path = std::env::temp_dir().join(format!("glitter-{}-{}.png", std::process::id(), name));
        image::RgbaImage::from_pixel(size, size, image::Rgba([255, 0, 0, 128]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn decode_png() {
        let path = temp_png("decode", 4);
        let image = decode(&path).unwrap();
        assert_eq!(image.dimensions(), (4, 4));
        assert_eq!(image.get_pixel(1, 1), &image::Rgba([255, 0, 0, 128]));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn decode_missing_file() {
        match decode(Path::new("/definitely/not/here.png")) {
            Err(EngineError::ImageLoad { path, .. }) => {
                assert_eq!(path, PathBuf::from("/definitely/not/here.png"))
            }
            other => panic!("expected an image load error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn loads_in_background() {
        let path = temp_png("background", 8);
        let mut loader = ImageLoader::new().unwrap();
        loader.request(&path);
        let result = loader.wait(Duration::from_secs(10)).unwrap();
        assert_eq!(result.path, path);
        assert_eq!(result.image.unwrap().dimensions(), (8, 8));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn only_newest_request_is_delivered() {
        let small = temp_png("small", 2);
        let large = temp_png("large", 16);
        let mut loader = ImageLoader::new().unwrap();
        loader.request(&small);
        loader.request(&large);
        let result = loader.wait(Duration::from_secs(10)).unwrap();
        assert_eq!(result.path, large);
        assert!(loader.poll().is_none());
        std::fs::remove_file(small).unwrap();
        std::fs::remove_file(large).unwrap();
    }

    #[test]
    fn cancelled_requests_are_dropped() {
        let path = temp_png("cancelled", 2);
        let mut loader = ImageLoader::new().unwrap();
        loader.request(&path);
        loader.cancel();
        assert!(loader.wait(Duration::from_millis(500)).is_none());
        std::fs::remove_file(path).unwrap();
    }
}
