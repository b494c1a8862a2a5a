use std::{io, sync::Arc};

use drm::control::crtc;
use drm_fourcc::DrmFourcc;
use tracing::{debug, trace};

use super::{buffer::BufferHandle, device::KmsDevice, error::Error};
use crate::utils::{Buffer, Physical, Point, Size};

/// What the next frame does with the cursor plane
#[derive(Debug)]
pub(crate) enum CursorUpdate {
    Hide,
    Show {
        position: Point<i32, Physical>,
        /// new image, `size.w * size.h * 4` bytes of ARGB8888
        image: Option<Vec<u8>>,
    },
}

/// Hardware cursor of one crtc
///
/// Image updates alternate between two dumb buffers, so the buffer being scanned out is
/// never written to.
#[derive(Debug)]
pub(crate) struct CursorState {
    size: Size<u32, Buffer>,
    buffers: [Option<BufferHandle>; 2],
    current: usize,
    staged: Option<CursorUpdate>,
    position: Option<Point<i32, Physical>>,
    visible: bool,
}

impl CursorState {
    pub(crate) fn new(size: Size<u32, Buffer>) -> Self {
        CursorState {
            size,
            buffers: [None, None],
            current: 0,
            staged: None,
            position: None,
            visible: false,
        }
    }

    pub(crate) fn size(&self) -> Size<u32, Buffer> {
        self.size
    }

    pub(crate) fn is_visible(&self) -> bool {
        self.visible
    }

    pub(crate) fn position(&self) -> Option<Point<i32, Physical>> {
        self.position
    }

    /// Whether an image was uploaded before and can be shown again without a copy
    pub(crate) fn has_image(&self) -> bool {
        self.buffers[self.current].is_some()
    }

    pub(crate) fn staging_area(&self) -> Vec<u8> {
        vec![0; self.size.w as usize * self.size.h as usize * 4]
    }

    pub(crate) fn stride(&self) -> u32 {
        self.size.w * 4
    }

    pub(crate) fn stage(&mut self, update: CursorUpdate) {
        self.staged = Some(update);
    }

    pub(crate) fn discard(&mut self) {
        self.staged = None;
    }

    fn buffer(&mut self, device: &Arc<dyn KmsDevice>, idx: usize) -> Result<&BufferHandle, Error> {
        let buffer = match self.buffers[idx].take() {
            Some(buffer) => buffer,
            None => {
                debug!(size = ?self.size, "allocating cursor buffer");
                BufferHandle::dumb_unregistered(device.clone(), self.size, DrmFourcc::Argb8888)?
            }
        };
        Ok(self.buffers[idx].insert(buffer))
    }

    /// Apply the staged update, if any
    ///
    /// Does nothing for frames that were not assigned.
    pub(crate) fn commit(&mut self, device: &Arc<dyn KmsDevice>, crtc: crtc::Handle) -> Result<(), Error> {
        match self.staged.take() {
            None => Ok(()),
            Some(CursorUpdate::Hide) => self.hide(device.as_ref(), crtc).map_err(|source| access(device, source)),
            Some(CursorUpdate::Show { position, image }) => {
                if let Some(image) = image {
                    let next = self.current ^ 1;
                    let bo = self.buffer(device, next)?.bo().clone();
                    device
                        .write_dumb_buffer(&bo, &image)
                        .map_err(|source| access(device, source))?;
                    trace!(?crtc, "uploading cursor image");
                    device
                        .set_cursor(crtc, Some(&bo))
                        .map_err(|source| access(device, source))?;
                    self.current = next;
                    self.visible = true;
                } else if !self.visible {
                    if let Some(current) = &self.buffers[self.current] {
                        device
                            .set_cursor(crtc, Some(current.bo()))
                            .map_err(|source| access(device, source))?;
                        self.visible = true;
                    }
                }

                if self.position != Some(position) {
                    device
                        .move_cursor(crtc, position)
                        .map_err(|source| access(device, source))?;
                    self.position = Some(position);
                }
                Ok(())
            }
        }
    }

    /// Unset the cursor image if one is shown
    pub(crate) fn hide(&mut self, device: &dyn KmsDevice, crtc: crtc::Handle) -> io::Result<()> {
        self.staged = None;
        if self.visible {
            trace!(?crtc, "hiding cursor");
            device.set_cursor(crtc, None)?;
            self.visible = false;
        }
        Ok(())
    }

    /// Forget the programmed position, e.g. after the device was paused
    pub(crate) fn invalidate(&mut self) {
        self.position = None;
        self.visible = false;
        self.staged = None;
    }
}

fn access(device: &Arc<dyn KmsDevice>, source: io::Error) -> Error {
    Error::Access(super::error::AccessError {
        errmsg: "Failed to update cursor",
        dev: device.dev_path(),
        source,
    })
}
