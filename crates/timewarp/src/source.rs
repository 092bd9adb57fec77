//! Ring of submitted eye images.
//!
//! The producer owns the write half and fills slot `submission % 4`; the warp
//! thread reads through a [`SourceView`]. Every slot is its own lockless
//! exchange, so a slot overwritten while the warp thread copies it still
//! yields a whole value.

use glam::{Mat4, Quat};
use serde::Serialize;

use crate::error::WarpError;
use crate::fence::FenceHandle;
use crate::lockless::{slot_exchange, Publisher, Reader};

pub const MAX_WARP_SOURCES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    pub fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }
}

/// Texture name in the host rendering context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TextureId(pub u32);

impl TextureId {
    /// Built-in opaque black image.
    pub const BLACK: Self = Self(u32::MAX);
}

/// Image stream owned outside the rendering context (camera, video decoder).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ExternalHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EyeTexture {
    Owned(TextureId),
    External(ExternalHandle),
}

/// One rendered eye and the head orientation it was rendered with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeImage {
    /// `None` when the application left this eye empty.
    pub texture: Option<TextureId>,
    pub pose: Quat,
    /// Projects tangent-space view angles to texture coordinates.
    pub tex_coords_from_tan_angles: Mat4,
}

impl EyeImage {
    pub fn new(texture: TextureId, pose: Quat) -> Self {
        Self {
            texture: Some(texture),
            pose,
            tex_coords_from_tan_angles: default_tex_coords_from_tan_angles(),
        }
    }
}

/// Symmetric 90° field of view mapped onto `[0, 1]` texture space.
pub fn default_tex_coords_from_tan_angles() -> Mat4 {
    Mat4::from_cols_array(&[
        0.5, 0.0, 0.0, 0.0, //
        0.0, 0.5, 0.0, 0.0, //
        -0.5, -0.5, -1.0, -1.0, //
        0.0, 0.0, 0.0, 1.0,
    ])
}

/// What a submission shows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EyeImageSet {
    Stereo { left: EyeImage, right: EyeImage },
    /// One image shown to both eyes.
    Mono(EyeImage),
    External { handle: ExternalHandle, pose: Quat },
}

/// Per-eye view of an [`EyeImageSet`] used by the warp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeLayer {
    pub texture: Option<EyeTexture>,
    pub pose: Quat,
    pub tex_coords_from_tan_angles: Mat4,
}

impl EyeImageSet {
    pub fn layer(&self, eye: Eye) -> EyeLayer {
        let image = match self {
            EyeImageSet::Stereo { left, right } => match eye {
                Eye::Left => left,
                Eye::Right => right,
            },
            EyeImageSet::Mono(image) => image,
            EyeImageSet::External { handle, pose } => {
                return EyeLayer {
                    texture: Some(EyeTexture::External(*handle)),
                    pose: *pose,
                    tex_coords_from_tan_angles: default_tex_coords_from_tan_angles(),
                }
            }
        };
        EyeLayer {
            texture: image.texture.map(EyeTexture::Owned),
            pose: image.pose,
            tex_coords_from_tan_angles: image.tex_coords_from_tan_angles,
        }
    }

    /// Fills empty eyes with the built-in black image.
    pub fn with_default_images(self) -> Self {
        let fill = |mut image: EyeImage| {
            image.texture.get_or_insert(TextureId::BLACK);
            image
        };
        match self {
            EyeImageSet::Stereo { left, right } => EyeImageSet::Stereo {
                left: fill(left),
                right: fill(right),
            },
            EyeImageSet::Mono(image) => EyeImageSet::Mono(fill(image)),
            external @ EyeImageSet::External { .. } => external,
        }
    }
}

/// A published submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarpSource {
    /// 1-based submission count.
    pub submission: u64,
    /// Not displayable at this vsync or earlier.
    pub minimum_vsync: i64,
    /// Vsync each eye first showed this source; zero until then. Only the warp
    /// thread's private copy is ever updated.
    pub first_displayed_vsync: [i64; 2],
    pub completion_fence: FenceHandle,
    pub disable_chromatic_correction: bool,
    /// Applied once per refresh the source has been held for, up to three.
    pub external_velocity: Quat,
    /// Lead time for sliced warps, in seconds.
    pub pre_schedule_seconds: f64,
    /// Per-frame override of the configured sliced warp.
    pub sliced: Option<bool>,
    pub payload: EyeImageSet,
}

impl WarpSource {
    pub fn external_velocity_steps(&self, base: i64) -> u32 {
        (base - self.minimum_vsync).clamp(0, 3) as u32
    }
}

/// Creates the producer and consumer halves of an empty ring.
pub fn source_ring() -> (SourceRing, SourceView) {
    let (count, count_reader) = slot_exchange(0u64);
    let mut slots = Vec::with_capacity(MAX_WARP_SOURCES);
    let mut readers = Vec::with_capacity(MAX_WARP_SOURCES);
    for _ in 0..MAX_WARP_SOURCES {
        let (publisher, reader) = slot_exchange::<Option<WarpSource>>(None);
        slots.push(publisher);
        readers.push(reader);
    }
    (
        SourceRing { slots, count },
        SourceView {
            slots: readers,
            count: count_reader,
        },
    )
}

/// Producer half: appends submissions.
pub struct SourceRing {
    slots: Vec<Publisher<Option<WarpSource>>>,
    count: Publisher<u64>,
}

impl SourceRing {
    /// Number of submissions published so far.
    pub fn submission_count(&self) -> u64 {
        self.count.current()
    }

    /// Stores `source` under the next submission number and publishes the new
    /// count. Returns the number and the source it evicted, if any.
    pub fn publish(&mut self, mut source: WarpSource) -> (u64, Option<WarpSource>) {
        let submission = self.count.current() + 1;
        source.submission = submission;
        source.first_displayed_vsync = [0, 0];
        let slot = &mut self.slots[(submission % MAX_WARP_SOURCES as u64) as usize];
        let evicted = slot.current();
        slot.publish(Some(source));
        self.count.publish(submission);
        (submission, evicted)
    }
}

/// Consumer half, held by the warp loop.
#[derive(Clone)]
pub struct SourceView {
    slots: Vec<Reader<Option<WarpSource>>>,
    count: Reader<u64>,
}

/// Outcome of choosing what to show at a vsync.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selection {
    /// A source newer than the one on screen.
    Fresh(WarpSource),
    /// Keep showing the current source.
    Held,
    /// Nothing has ever been eligible.
    Empty,
}

impl SourceView {
    pub fn latest(&self) -> u64 {
        self.count.read()
    }

    /// The source stored for `submission`, if it has not been overwritten.
    pub fn get(&self, submission: u64) -> Option<WarpSource> {
        if submission == 0 {
            return None;
        }
        let slot = &self.slots[(submission % MAX_WARP_SOURCES as u64) as usize];
        slot.read().filter(|source| source.submission == submission)
    }

    /// Picks the newest source displayable at `base`.
    ///
    /// Looks back at most `MAX_WARP_SOURCES - 1` submissions, never past the
    /// one currently on screen. A candidate is eligible when its
    /// `minimum_vsync` is strictly below `base` and `is_ready` reports its
    /// fence as signalled.
    pub fn select<F>(
        &self,
        base: i64,
        current: Option<u64>,
        mut is_ready: F,
    ) -> Result<Selection, WarpError>
    where
        F: FnMut(&WarpSource) -> Result<bool, WarpError>,
    {
        let latest = self.latest();
        for back in 0..(MAX_WARP_SOURCES as u64 - 1) {
            let Some(submission) = latest.checked_sub(back).filter(|n| *n > 0) else {
                break;
            };
            if current.is_some_and(|shown| submission <= shown) {
                break;
            }
            let Some(source) = self.get(submission) else {
                continue;
            };
            if source.minimum_vsync >= base {
                continue;
            }
            if !is_ready(&source)? {
                continue;
            }
            return Ok(Selection::Fresh(source));
        }
        Ok(if current.is_some() {
            Selection::Held
        } else {
            Selection::Empty
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(minimum_vsync: i64) -> WarpSource {
        WarpSource {
            submission: 0,
            minimum_vsync,
            first_displayed_vsync: [0, 0],
            completion_fence: FenceHandle::NONE,
            disable_chromatic_correction: false,
            external_velocity: Quat::IDENTITY,
            pre_schedule_seconds: 0.0,
            sliced: None,
            payload: EyeImageSet::Mono(EyeImage::new(TextureId(1), Quat::IDENTITY)),
        }
    }

    fn always_ready(_: &WarpSource) -> Result<bool, WarpError> {
        Ok(true)
    }

    #[test]
    fn empty_ring_selects_nothing() {
        let (_ring, view) = source_ring();
        assert_eq!(view.select(5, None, always_ready).unwrap(), Selection::Empty);
    }

    #[test]
    fn newest_eligible_source_wins() {
        let (mut ring, view) = source_ring();
        ring.publish(source(1));
        ring.publish(source(2));
        let (third, _) = ring.publish(source(3));
        assert_eq!(third, 3);

        match view.select(4, None, always_ready).unwrap() {
            Selection::Fresh(chosen) => assert_eq!(chosen.submission, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn source_is_never_shown_at_its_minimum_vsync() {
        let (mut ring, view) = source_ring();
        ring.publish(source(7));
        ring.publish(source(8));
        match view.select(8, None, always_ready).unwrap() {
            Selection::Fresh(chosen) => {
                assert_eq!(chosen.submission, 1);
                assert!(chosen.minimum_vsync < 8);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(view.select(7, None, always_ready).unwrap(), Selection::Empty);
    }

    #[test]
    fn unsignalled_fence_falls_back_to_older_source() {
        let (mut ring, view) = source_ring();
        ring.publish(source(0));
        ring.publish(source(0));
        let chosen = view
            .select(1, None, |candidate| Ok(candidate.submission != 2))
            .unwrap();
        assert!(matches!(chosen, Selection::Fresh(s) if s.submission == 1));
    }

    #[test]
    fn never_goes_back_past_the_displayed_source() {
        let (mut ring, view) = source_ring();
        ring.publish(source(0));
        ring.publish(source(0));
        let chosen = view
            .select(1, Some(1), |candidate| Ok(candidate.submission != 2))
            .unwrap();
        assert_eq!(chosen, Selection::Held);
    }

    #[test]
    fn lookback_is_limited_to_three_entries() {
        let (mut ring, view) = source_ring();
        for _ in 0..4 {
            ring.publish(source(0));
        }
        let chosen = view
            .select(1, None, |candidate| Ok(candidate.submission == 1))
            .unwrap();
        assert_eq!(chosen, Selection::Empty);
    }

    #[test]
    fn wrapped_slots_report_evictions() {
        let (mut ring, view) = source_ring();
        for _ in 0..MAX_WARP_SOURCES {
            let (_, evicted) = ring.publish(source(0));
            assert!(evicted.is_none());
        }
        let (fifth, evicted) = ring.publish(source(0));
        assert_eq!(fifth, 5);
        assert_eq!(evicted.map(|s| s.submission), Some(1));
        assert!(view.get(1).is_none());
        assert_eq!(view.get(5).map(|s| s.submission), Some(5));
        assert_eq!(ring.submission_count(), 5);
    }

    #[test]
    fn fence_errors_propagate() {
        let (mut ring, view) = source_ring();
        ring.publish(source(0));
        let err = view
            .select(1, None, |candidate| {
                Err(WarpError::FenceFailed {
                    submission: candidate.submission,
                })
            })
            .unwrap_err();
        assert!(err.is_gpu_fault());
    }

    #[test]
    fn default_images_fill_empty_eyes() {
        let empty = EyeImage {
            texture: None,
            ..EyeImage::new(TextureId(9), Quat::IDENTITY)
        };
        let set = EyeImageSet::Stereo {
            left: empty,
            right: EyeImage::new(TextureId(4), Quat::IDENTITY),
        }
        .with_default_images();
        assert_eq!(
            set.layer(Eye::Left).texture,
            Some(EyeTexture::Owned(TextureId::BLACK))
        );
        assert_eq!(
            set.layer(Eye::Right).texture,
            Some(EyeTexture::Owned(TextureId(4)))
        );
    }

    #[test]
    fn mono_and_external_sets_show_the_same_image_to_both_eyes() {
        let mono = EyeImageSet::Mono(EyeImage::new(TextureId(3), Quat::IDENTITY));
        assert_eq!(mono.layer(Eye::Left), mono.layer(Eye::Right));

        let external = EyeImageSet::External {
            handle: ExternalHandle(11),
            pose: Quat::from_rotation_y(0.1),
        };
        assert_eq!(
            external.layer(Eye::Right).texture,
            Some(EyeTexture::External(ExternalHandle(11)))
        );
    }

    #[test]
    fn velocity_steps_are_capped() {
        let held = WarpSource {
            minimum_vsync: 10,
            ..source(0)
        };
        assert_eq!(held.external_velocity_steps(9), 0);
        assert_eq!(held.external_velocity_steps(12), 2);
        assert_eq!(held.external_velocity_steps(40), 3);
    }
}
