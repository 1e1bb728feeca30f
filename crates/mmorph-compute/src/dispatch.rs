//! Kernel dispatcher.
//!
//! Turns a [`MorphOp`] into one or more kernel launches against an open
//! image. Every launch binds the image's current in/out buffers and, once
//! enqueued, flips their roles so the next launch reads what this one
//! wrote. Composite operations (dilation, erosion, opening, closing) expand
//! to their primitive passes first.
//!
//! # Geometry
//!
//! | Operation | Global | Local (CPU) | Local (parallel) |
//! |-----------|--------|-------------|------------------|
//! | `binarize`, `naivemorph` | explicit, else `cols x rows` | `1x1` | explicit, else device preference |
//! | `unbitmap`, `bitmappedbinarize` | `pixels / 32` | `1` | [`PARALLEL_LANES`] |
//! | packed passes | `cols / 32 x rows` | `1x1` | explicit, else device preference |
//!
//! A launch the device rejects leaves the image's roles untouched.

use tracing::debug;

use crate::device::{Event, NdRange};
use crate::image::{ImageId, ImageSession};
use crate::kernels::{Kernel, KernelLaunch, PARALLEL_LANES, WORD_BITS};
use crate::se::SeId;
use crate::session::DeviceSession;
use crate::{ComputeError, ComputeResult, ELEMENT_SIZE, Pixel};

/// A morphology operation on one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorphOp {
    // Single dispatches
    /// Packed words to one pixel per bit.
    Unbitmap,
    /// `out = if in >= threshold { max } else { min }`.
    Binarize { threshold: Pixel, min: Pixel, max: Pixel },
    /// `in >= threshold` packed one bit per pixel; `inverted` packs the
    /// complement.
    BitmappedBinarize { threshold: Pixel, inverted: bool },
    /// Weighted neighborhood sum of `se` compared against `target`.
    NaiveMorph { se: SeId, target: i32 },
    BitmappedDilationH { colrad: u32 },
    BitmappedDilationV { rowrad: u32 },
    BitmappedErosionH { colrad: u32 },
    BitmappedErosionV { rowrad: u32 },

    // Composites
    NaiveDilation(SeId),
    NaiveErosion(SeId),
    /// Erosion then dilation.
    NaiveOpening(SeId),
    /// Dilation then erosion.
    NaiveClosing(SeId),
    /// Horizontal then vertical pass.
    BitmappedDilation { rowrad: u32, colrad: u32 },
    BitmappedErosion { rowrad: u32, colrad: u32 },
    BitmappedOpening { rowrad: u32, colrad: u32 },
    BitmappedClosing { rowrad: u32, colrad: u32 },
}

impl MorphOp {
    /// Short name used in logs and precondition errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unbitmap => "unbitmap",
            Self::Binarize { .. } => "binarize",
            Self::BitmappedBinarize { .. } => "bitmappedbinarize",
            Self::NaiveMorph { .. } => "naivemorph",
            Self::BitmappedDilationH { .. } => "bitmapped_dilation_h",
            Self::BitmappedDilationV { .. } => "bitmapped_dilation_v",
            Self::BitmappedErosionH { .. } => "bitmapped_erosion_h",
            Self::BitmappedErosionV { .. } => "bitmapped_erosion_v",
            Self::NaiveDilation(_) => "naive_dilation",
            Self::NaiveErosion(_) => "naive_erosion",
            Self::NaiveOpening(_) => "naive_opening",
            Self::NaiveClosing(_) => "naive_closing",
            Self::BitmappedDilation { .. } => "bitmapped_dilation",
            Self::BitmappedErosion { .. } => "bitmapped_erosion",
            Self::BitmappedOpening { .. } => "bitmapped_opening",
            Self::BitmappedClosing { .. } => "bitmapped_closing",
        }
    }

    /// True for operations issued as more than one dispatch or needing
    /// structuring element lookup to pick a target.
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            Self::NaiveDilation(_)
                | Self::NaiveErosion(_)
                | Self::NaiveOpening(_)
                | Self::NaiveClosing(_)
                | Self::BitmappedDilation { .. }
                | Self::BitmappedErosion { .. }
                | Self::BitmappedOpening { .. }
                | Self::BitmappedClosing { .. }
        )
    }

    /// Primitive passes in issue order.
    ///
    /// `targets` maps a structuring element to its `(dilation, erosion)`
    /// target sums.
    pub fn expand<F>(&self, targets: F) -> ComputeResult<Vec<MorphOp>>
    where
        F: Fn(SeId) -> ComputeResult<(i32, i32)>,
    {
        let dilate = |se: SeId| -> ComputeResult<MorphOp> {
            Ok(MorphOp::NaiveMorph { se, target: targets(se)?.0 })
        };
        let erode = |se: SeId| -> ComputeResult<MorphOp> {
            Ok(MorphOp::NaiveMorph { se, target: targets(se)?.1 })
        };
        let bm_dilate = |rowrad, colrad| [Self::BitmappedDilationH { colrad }, Self::BitmappedDilationV { rowrad }];
        let bm_erode = |rowrad, colrad| [Self::BitmappedErosionH { colrad }, Self::BitmappedErosionV { rowrad }];

        Ok(match *self {
            Self::NaiveDilation(se) => vec![dilate(se)?],
            Self::NaiveErosion(se) => vec![erode(se)?],
            Self::NaiveOpening(se) => vec![erode(se)?, dilate(se)?],
            Self::NaiveClosing(se) => vec![dilate(se)?, erode(se)?],
            Self::BitmappedDilation { rowrad, colrad } => bm_dilate(rowrad, colrad).to_vec(),
            Self::BitmappedErosion { rowrad, colrad } => bm_erode(rowrad, colrad).to_vec(),
            Self::BitmappedOpening { rowrad, colrad } => {
                [bm_erode(rowrad, colrad), bm_dilate(rowrad, colrad)].concat()
            }
            Self::BitmappedClosing { rowrad, colrad } => {
                [bm_dilate(rowrad, colrad), bm_erode(rowrad, colrad)].concat()
            }
            primitive => vec![primitive],
        })
    }
}

/// Checks that `pixels` splits into whole packed words, `lanes` words per
/// work-group.
fn check_packed(op: &'static str, pixels: usize, lanes: usize) -> ComputeResult<()> {
    let unit = WORD_BITS * lanes;
    if pixels % unit != 0 {
        return Err(ComputeError::precondition(
            op,
            format!("pixel count {pixels} is not a multiple of {unit} ({WORD_BITS} bits x {lanes} lanes)"),
        ));
    }
    Ok(())
}

/// Checks that every row is a whole number of packed words.
fn check_packed_rows(op: &'static str, ncols: u32) -> ComputeResult<()> {
    if ncols as usize % WORD_BITS != 0 {
        return Err(ComputeError::precondition(
            op,
            format!("{ncols} columns is not a multiple of {WORD_BITS}"),
        ));
    }
    Ok(())
}

impl DeviceSession {
    // =========================================================================
    // Explicit-image dispatch
    // =========================================================================

    /// Issues `op` against image `id` and returns the last dispatch's event.
    ///
    /// Composite operations stop at the first failing pass; passes already
    /// enqueued stay enqueued.
    pub fn push(&mut self, id: ImageId, op: MorphOp) -> ComputeResult<Event> {
        if !self.images.contains_key(&id) {
            return Err(ComputeError::UnknownImage(id));
        }
        let passes = op.expand(|se| {
            let desc = self.ses.get(se)?;
            Ok((desc.dilation_target(), desc.erosion_target()))
        })?;

        let mut last = None;
        for pass in passes {
            last = Some(self.enqueue(id, pass)?);
        }
        last.ok_or_else(|| ComputeError::precondition(op.name(), "expanded to no dispatches"))
    }

    /// Enqueues one primitive pass and flips the image's roles.
    fn enqueue(&mut self, id: ImageId, op: MorphOp) -> ComputeResult<Event> {
        let image = self.images.get(&id).ok_or(ComputeError::UnknownImage(id))?;
        let (kernel, global, local) = self.plan(image, op)?;
        let launch = KernelLaunch {
            kernel: &kernel,
            input: image.input(),
            output: image.output(),
            nrows: image.nrows(),
            ncols: image.ncols(),
            global,
            local,
        };
        let event = self.device.enqueue_kernel(&launch)?;
        debug!(
            image = %id,
            kernel = %kernel.name(),
            global = %global,
            local = %local,
            input = launch.input.id(),
            output = launch.output.id(),
            "Kernel enqueued"
        );

        if let Some(image) = self.images.get_mut(&id) {
            image.swap_buffers();
        }
        Ok(event)
    }

    /// Kernel arguments and geometry for one primitive pass.
    fn plan(&self, image: &ImageSession, op: MorphOp) -> ComputeResult<(Kernel, NdRange, NdRange)> {
        let cpu = self.is_cpu();
        let lanes = if cpu { 1 } else { PARALLEL_LANES };
        let pixels = image.pixel_count();

        let planned = match op {
            MorphOp::Unbitmap => {
                check_packed(op.name(), pixels, lanes)?;
                (Kernel::Unbitmap, NdRange::D1(pixels / WORD_BITS), NdRange::D1(lanes))
            }
            MorphOp::Binarize { threshold, min, max } => {
                let global = self.grid_size(image);
                (Kernel::Binarize { threshold, min, max }, global, self.group_size(global))
            }
            MorphOp::BitmappedBinarize { threshold, inverted } => {
                check_packed(op.name(), pixels, lanes)?;
                let (below, above) = if inverted { (1, 0) } else { (0, 1) };
                let kernel = Kernel::BitmappedBinarize {
                    threshold,
                    below,
                    above,
                    scratch_bytes: WORD_BITS * lanes * ELEMENT_SIZE,
                };
                (kernel, NdRange::D1(pixels / WORD_BITS), NdRange::D1(lanes))
            }
            MorphOp::NaiveMorph { se, target } => {
                let desc = self.ses.get(se)?;
                let global = self.grid_size(image);
                let local = self.group_size(global);
                let tile = (local.x() + 2 * desc.colrad as usize) * (local.y() + 2 * desc.rowrad as usize);
                let kernel = Kernel::NaiveMorph {
                    se: desc.binding(),
                    target,
                    se_scratch_bytes: desc.buffer_bytes(),
                    tile_scratch_bytes: tile * ELEMENT_SIZE,
                };
                (kernel, global, local)
            }
            MorphOp::BitmappedDilationH { colrad } => {
                self.packed_pass(image, op, Kernel::BitmappedDilationH { colrad })?
            }
            MorphOp::BitmappedDilationV { rowrad } => {
                self.packed_pass(image, op, Kernel::BitmappedDilationV { rowrad })?
            }
            MorphOp::BitmappedErosionH { colrad } => {
                self.packed_pass(image, op, Kernel::BitmappedErosionH { colrad })?
            }
            MorphOp::BitmappedErosionV { rowrad } => {
                self.packed_pass(image, op, Kernel::BitmappedErosionV { rowrad })?
            }
            composite => {
                return Err(ComputeError::precondition(
                    composite.name(),
                    "composite operations are issued through push",
                ));
            }
        };
        Ok(planned)
    }

    fn packed_pass(
        &self,
        image: &ImageSession,
        op: MorphOp,
        kernel: Kernel,
    ) -> ComputeResult<(Kernel, NdRange, NdRange)> {
        check_packed_rows(op.name(), image.ncols())?;
        let global = NdRange::D2(image.ncols() as usize / WORD_BITS, image.nrows() as usize);
        Ok((kernel, global, self.group_size(global)))
    }

    /// Global size for image-grid kernels.
    fn grid_size(&self, image: &ImageSession) -> NdRange {
        self.global_work_size.unwrap_or_else(|| image.default_global_size())
    }

    /// Work-group size for `global`: unit on CPU-class devices, else the
    /// caller's choice or the device preference.
    fn group_size(&self, global: NdRange) -> NdRange {
        if self.is_cpu() {
            return global.unit_like();
        }
        self.local_work_size
            .unwrap_or_else(|| self.device.preferred_local_size(global))
    }

    // =========================================================================
    // Current-image dispatch
    // =========================================================================

    fn push_current(&mut self, op: MorphOp) -> ComputeResult<Event> {
        let id = self.current_id()?;
        self.push(id, op)
    }

    /// Expands the packed current image to one pixel per bit.
    pub fn push_unbitmap(&mut self) -> ComputeResult<Event> {
        self.push_current(MorphOp::Unbitmap)
    }

    /// Thresholds the current image to `max` (at or above) / `min` (below).
    pub fn push_binarize(&mut self, threshold: Pixel, min: Pixel, max: Pixel) -> ComputeResult<Event> {
        self.push_current(MorphOp::Binarize { threshold, min, max })
    }

    /// Thresholds the current image into a packed bitmap.
    pub fn push_bitmapped_binarize(&mut self, threshold: Pixel, inverted: bool) -> ComputeResult<Event> {
        self.push_current(MorphOp::BitmappedBinarize { threshold, inverted })
    }

    pub fn push_naivemorph(&mut self, se: SeId, target: i32) -> ComputeResult<Event> {
        self.push_current(MorphOp::NaiveMorph { se, target })
    }

    pub fn push_naive_dilation(&mut self, se: SeId) -> ComputeResult<Event> {
        self.push_current(MorphOp::NaiveDilation(se))
    }

    pub fn push_naive_erosion(&mut self, se: SeId) -> ComputeResult<Event> {
        self.push_current(MorphOp::NaiveErosion(se))
    }

    /// Erosion then dilation; returns the dilation event.
    pub fn push_naive_opening(&mut self, se: SeId) -> ComputeResult<Event> {
        self.push_current(MorphOp::NaiveOpening(se))
    }

    /// Dilation then erosion; returns the erosion event.
    pub fn push_naive_closing(&mut self, se: SeId) -> ComputeResult<Event> {
        self.push_current(MorphOp::NaiveClosing(se))
    }

    pub fn push_bitmapped_dilation_h(&mut self, colrad: u32) -> ComputeResult<Event> {
        self.push_current(MorphOp::BitmappedDilationH { colrad })
    }

    pub fn push_bitmapped_dilation_v(&mut self, rowrad: u32) -> ComputeResult<Event> {
        self.push_current(MorphOp::BitmappedDilationV { rowrad })
    }

    pub fn push_bitmapped_erosion_h(&mut self, colrad: u32) -> ComputeResult<Event> {
        self.push_current(MorphOp::BitmappedErosionH { colrad })
    }

    pub fn push_bitmapped_erosion_v(&mut self, rowrad: u32) -> ComputeResult<Event> {
        self.push_current(MorphOp::BitmappedErosionV { rowrad })
    }

    pub fn push_bitmapped_dilation(&mut self, rowrad: u32, colrad: u32) -> ComputeResult<Event> {
        self.push_current(MorphOp::BitmappedDilation { rowrad, colrad })
    }

    pub fn push_bitmapped_erosion(&mut self, rowrad: u32, colrad: u32) -> ComputeResult<Event> {
        self.push_current(MorphOp::BitmappedErosion { rowrad, colrad })
    }

    /// Four packed passes: erosion (h, v) then dilation (h, v).
    pub fn push_bitmapped_opening(&mut self, rowrad: u32, colrad: u32) -> ComputeResult<Event> {
        self.push_current(MorphOp::BitmappedOpening { rowrad, colrad })
    }

    /// Four packed passes: dilation (h, v) then erosion (h, v).
    pub fn push_bitmapped_closing(&mut self, rowrad: u32, colrad: u32) -> ComputeResult<Event> {
        self.push_current(MorphOp::BitmappedClosing { rowrad, colrad })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AsAny, DeviceClass, HostDevice, status};
    use crate::{Kernel, KernelName, SessionConfig};
    use mmorph_core::{Image2d, Window};

    fn targets(_: SeId) -> ComputeResult<(i32, i32)> {
        Ok((-8, 9))
    }

    fn emulated() -> DeviceSession {
        let device = Box::new(HostDevice::emulating(DeviceClass::Gpu));
        DeviceSession::with_device(device, SessionConfig::default()).unwrap()
    }

    fn log(session: &DeviceSession) -> Vec<crate::DispatchRecord> {
        session
            .device()
            .as_any()
            .downcast_ref::<HostDevice>()
            .map(HostDevice::dispatch_log)
            .unwrap_or_default()
    }

    #[test]
    fn test_expand_naive_order() {
        let se = SeId(3);
        let open = MorphOp::NaiveOpening(se).expand(targets).unwrap();
        assert_eq!(
            open,
            vec![MorphOp::NaiveMorph { se, target: 9 }, MorphOp::NaiveMorph { se, target: -8 }]
        );
        let close = MorphOp::NaiveClosing(se).expand(targets).unwrap();
        assert_eq!(close[0], MorphOp::NaiveMorph { se, target: -8 });
        assert!(MorphOp::NaiveOpening(se).is_composite());
        assert!(!MorphOp::Unbitmap.is_composite());
    }

    #[test]
    fn test_expand_bitmapped_order() {
        let passes = MorphOp::BitmappedOpening { rowrad: 2, colrad: 3 }.expand(targets).unwrap();
        assert_eq!(
            passes,
            vec![
                MorphOp::BitmappedErosionH { colrad: 3 },
                MorphOp::BitmappedErosionV { rowrad: 2 },
                MorphOp::BitmappedDilationH { colrad: 3 },
                MorphOp::BitmappedDilationV { rowrad: 2 },
            ]
        );
        let single = MorphOp::Binarize { threshold: 1, min: 0, max: 1 };
        assert_eq!(single.expand(targets).unwrap(), vec![single]);
    }

    #[test]
    fn test_parallel_packed_geometry() {
        let mut session = emulated();
        let id = session.open(&Image2d::filled(64, 64, 200)).unwrap();
        session.push(id, MorphOp::BitmappedBinarize { threshold: 128, inverted: false }).unwrap();

        let rec = &log(&session)[0];
        assert_eq!(rec.kernel, KernelName::BitmappedBinarize);
        assert_eq!(rec.global, NdRange::D1(128));
        assert_eq!(rec.local, NdRange::D1(PARALLEL_LANES));
        assert_eq!(rec.local_mem_bytes, 32 * 64 * 4);
    }

    #[test]
    fn test_parallel_requires_lane_multiple() {
        let mut session = emulated();
        // 1024 pixels divide by 32 but not by 32 * 64.
        let id = session.open(&Image2d::filled(32, 32, 1)).unwrap();
        let err = session.push(id, MorphOp::Unbitmap).unwrap_err();
        assert!(matches!(err, ComputeError::Precondition { op: "unbitmap", .. }));
        assert!(log(&session).is_empty());
        assert!(!session.image(id).unwrap().is_swapped());
    }

    #[test]
    fn test_naive_scratch_follows_local_size() {
        let mut session = emulated();
        let se = session.load_se(&Window::rect(3, 5).unwrap()).unwrap();
        let id = session.open(&Image2d::filled(16, 16, 1)).unwrap();
        session.set_local_work_size(Some(NdRange::D2(4, 4)));
        session.push(id, MorphOp::NaiveDilation(se)).unwrap();

        let rec = &log(&session)[0];
        assert_eq!(rec.local, NdRange::D2(4, 4));
        let tile = (4 + 2 * 2) * (4 + 2) * 4;
        assert_eq!(rec.local_mem_bytes, 15 * 3 * 4 + tile);
    }

    #[test]
    fn test_rejected_launch_keeps_roles() {
        let mut session = emulated();
        let id = session.open(&Image2d::filled(20, 20, 1)).unwrap();
        session.set_local_work_size(Some(NdRange::D2(8, 8)));
        let err = session.push(id, MorphOp::Binarize { threshold: 1, min: 0, max: 1 }).unwrap_err();
        assert_eq!(err.code(), Some(status::INVALID_WORK_GROUP_SIZE));
        assert!(!session.image(id).unwrap().is_swapped());
    }

    #[test]
    fn test_packed_rows_precondition() {
        let mut session = DeviceSession::new(DeviceClass::Cpu).unwrap();
        let id = session.open(&Image2d::filled(4, 40, 1)).unwrap();
        let err = session.push(id, MorphOp::BitmappedDilationH { colrad: 1 }).unwrap_err();
        assert!(matches!(err, ComputeError::Precondition { .. }));
    }

    #[test]
    fn test_plan_rejects_composites() {
        let mut session = DeviceSession::new(DeviceClass::Cpu).unwrap();
        let id = session.open(&Image2d::filled(8, 8, 1)).unwrap();
        let image = session.image(id).unwrap();
        let err = session
            .plan(image, MorphOp::BitmappedErosion { rowrad: 1, colrad: 1 })
            .unwrap_err();
        assert!(matches!(err, ComputeError::Precondition { .. }));

        let (kernel, global, local) = session.plan(image, MorphOp::Unbitmap).unwrap();
        assert!(matches!(kernel, Kernel::Unbitmap));
        assert_eq!((global, local), (NdRange::D1(2), NdRange::D1(1)));
    }
}
