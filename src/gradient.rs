use serde::{Deserialize, Serialize};

/// Number of texels in a baked lookup table.
pub const LOOKUP_WIDTH: u32 = 256;

/// 8 bit color channels with a unit alpha, the format gradient editors hand out.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: f32,
}

impl Rgba {
    pub const WHITE: Rgba = Rgba::opaque(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8, a: f32) -> Self {
        Rgba { r, g, b, a }
    }

    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Rgba { r, g, b, a: 1.0 }
    }

    fn channels(&self) -> [f32; 4] {
        [
            self.r as f32 / 255.0,
            self.g as f32 / 255.0,
            self.b as f32 / 255.0,
            self.a.max(0.0).min(1.0),
        ]
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GradientStop {
    /// Position along the gradient, 0..1.
    pub time: f32,
    pub color: Rgba,
}

impl GradientStop {
    pub fn new(time: f32, color: Rgba) -> Self {
        GradientStop { time, color }
    }
}

/// Control points of a color ramp, always kept sorted by time.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(from = "Vec<GradientStop>", into = "Vec<GradientStop>")]
pub struct Gradient {
    stops: Vec<GradientStop>,
}

impl From<Vec<GradientStop>> for Gradient {
    fn from(stops: Vec<GradientStop>) -> Self {
        Gradient::new(stops)
    }
}

impl From<Gradient> for Vec<GradientStop> {
    fn from(gradient: Gradient) -> Self {
        gradient.stops
    }
}

impl Gradient {
    pub fn new(mut stops: Vec<GradientStop>) -> Self {
        for stop in stops.iter_mut() {
            stop.time = if stop.time.is_nan() {
                0.0
            } else {
                stop.time.max(0.0).min(1.0)
            };
        }
        // Stable, so stops sharing a time keep their relative order.
        stops.sort_by(|a, b| {
            a.time
                .partial_cmp(&b.time)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Gradient { stops }
    }

    pub fn stops(&self) -> &[GradientStop] {
        &self.stops
    }

    /// Evaluates the ramp at `t`, channels in 0..1. The first and last stops
    /// extend to the ends, an empty gradient is opaque white.
    pub fn sample(&self, t: f32) -> [f32; 4] {
        let (first, last) = match (self.stops.first(), self.stops.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Rgba::WHITE.channels(),
        };
        if t <= first.time {
            return first.color.channels();
        }
        if t >= last.time {
            return last.color.channels();
        }
        for pair in self.stops.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            if t <= to.time {
                let span = to.time - from.time;
                let f = if span > 0.0 {
                    (t - from.time) / span
                } else {
                    1.0
                };
                let a = from.color.channels();
                let b = to.color.channels();
                let mut out = [0.0; 4];
                for i in 0..4 {
                    out[i] = a[i] + (b[i] - a[i]) * f;
                }
                return out;
            }
        }
        last.color.channels()
    }
}

/// A 1-D table mapping normalized age to RGBA8.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    texels: Vec<[u8; 4]>,
}

impl LookupTable {
    pub fn texels(&self) -> &[[u8; 4]] {
        &self.texels
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.texels)
    }

    /// Nearest texel for a clamped coordinate, like a ClampToEdge lookup.
    pub fn texel_at(&self, u: f32) -> [u8; 4] {
        let last = self.texels.len() - 1;
        let index = (u.max(0.0).min(1.0) * last as f32).round() as usize;
        self.texels[index.min(last)]
    }
}

fn to_unorm8(value: f32) -> u8 {
    (value.max(0.0).min(1.0) * 255.0).round() as u8
}

fn bake(mut texel: impl FnMut(f32) -> [u8; 4]) -> LookupTable {
    let texels = (0..LOOKUP_WIDTH)
        .map(|x| texel(x as f32 / (LOOKUP_WIDTH - 1) as f32))
        .collect();
    LookupTable { texels }
}

/// Bakes a color-over-life table. `None` or an empty gradient bakes opaque white.
pub fn bake_color(gradient: Option<&Gradient>) -> LookupTable {
    let empty = Gradient::new(vec![]);
    let gradient = gradient.unwrap_or(&empty);
    bake(|t| {
        let c = gradient.sample(t);
        [to_unorm8(c[0]), to_unorm8(c[1]), to_unorm8(c[2]), to_unorm8(c[3])]
    })
}

/// Bakes an opacity-over-life table. Only alpha is read, RGB is forced to white.
pub fn bake_opacity(gradient: Option<&Gradient>) -> LookupTable {
    let empty = Gradient::new(vec![]);
    let gradient = gradient.unwrap_or(&empty);
    bake(|t| [255, 255, 255, to_unorm8(gradient.sample(t)[3])])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientKind {
    Color,
    Opacity,
}

impl GradientKind {
    pub fn bake(&self, gradient: Option<&Gradient>) -> LookupTable {
        match self {
            GradientKind::Color => bake_color(gradient),
            GradientKind::Opacity => bake_opacity(gradient),
        }
    }

    /// Color texels are authored as display values, so they decode through
    /// sRGB and come back out unchanged on an sRGB target. Only the alpha of
    /// the opacity table is read, which is linear either way.
    pub fn format(&self) -> wgpu::TextureFormat {
        match self {
            GradientKind::Color => wgpu::TextureFormat::Rgba8UnormSrgb,
            GradientKind::Opacity => wgpu::TextureFormat::Rgba8Unorm,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            GradientKind::Color => "Color lookup texture",
            GradientKind::Opacity => "Opacity lookup texture",
        }
    }
}

/// Device copy of a baked table. The texture is rewritten in place when the
/// gradient changes, so views handed out earlier stay valid.
pub struct GradientTexture {
    kind: GradientKind,
    texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    baked: Option<Gradient>,
}

impl GradientTexture {
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        kind: GradientKind,
        gradient: Option<&Gradient>,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            size: GradientTexture::extent(),
            mip_level_count: 1,
            sample_count: 1,
            // A 2-D texture of height 1 so it can be sampled at (age, 0.5).
            dimension: wgpu::TextureDimension::D2,
            format: kind.format(),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            label: Some(kind.label()),
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let table = kind.bake(gradient);
        GradientTexture::write(queue, &texture, &table);
        GradientTexture {
            kind,
            texture,
            view,
            baked: gradient.cloned(),
        }
    }

    fn extent() -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: LOOKUP_WIDTH,
            height: 1,
            depth_or_array_layers: 1,
        }
    }

    fn write(queue: &wgpu::Queue, texture: &wgpu::Texture, table: &LookupTable) {
        queue.write_texture(
            texture.as_image_copy(),
            table.as_bytes(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: std::num::NonZeroU32::new(4 * LOOKUP_WIDTH),
                rows_per_image: None,
            },
            GradientTexture::extent(),
        );
    }

    /// Re-bakes if the control points differ from the last bake. Returns true
    /// if the texture was rewritten.
    pub fn update(&mut self, queue: &wgpu::Queue, gradient: Option<&Gradient>) -> bool {
        if self.baked.as_ref() == gradient {
            return false;
        }
        let table = self.kind.bake(gradient);
        GradientTexture::write(queue, &self.texture, &table);
        self.baked = gradient.cloned();
        log::info!("Rebaked {:?} gradient", self.kind);
        true
    }

    pub fn destroy(&self) {
        self.texture.destroy();
    }
}
