//! Frame stream
//!
//! Walks a stopped thread from its last managed frame up to the first
//! entry frame. Each item carries the register map produced by the step
//! that reached the frame, which is what reference scanning needs.

use crate::runtime::thread::ManagedThread;
use crate::vm::errors::{FrameError, FrameResult};

use super::{Frame, FrameEnv, RegisterLocationMap};

/// A frame together with the register map valid for it
#[derive(Debug, Clone)]
pub struct WalkedFrame<'a> {
    pub frame: Frame<'a>,
    pub map: RegisterLocationMap,
}

/// Iterator over the frames of one stack
#[derive(Debug)]
pub struct StackFrameStream<'a> {
    next: Option<FrameResult<Frame<'a>>>,
    map: RegisterLocationMap,
}

impl<'a> StackFrameStream<'a> {
    /// Stream starting at `thread`'s last managed frame
    pub fn new(
        thread: &ManagedThread,
        env: FrameEnv<'a>,
        update_map: bool,
    ) -> FrameResult<Self> {
        Ok(Self::from_frame(thread.last_frame(env)?, update_map))
    }

    /// Stream starting at an arbitrary frame
    pub fn from_frame(
        frame: Frame<'a>,
        update_map: bool,
    ) -> Self {
        Self {
            next: Some(Ok(frame)),
            map: RegisterLocationMap::new(update_map),
        }
    }

    fn advance(
        &mut self,
        frame: &Frame<'a>,
    ) -> Option<FrameResult<Frame<'a>>> {
        match frame.is_first_frame() {
            Ok(true) => return None,
            Ok(false) => {}
            Err(e) => return Some(Err(e)),
        }
        let step = frame.sender(&mut self.map).and_then(|sender| {
            // Every step must move up the stack or the walk could cycle.
            if sender.sp() <= frame.sp() {
                tracing::error!(%frame, %sender, "sender does not move up the stack");
                return Err(FrameError::NoProgress {
                    sp: frame.sp(),
                    sender_sp: sender.sp(),
                });
            }
            Ok(sender)
        });
        Some(step)
    }
}

impl<'a> Iterator for StackFrameStream<'a> {
    type Item = FrameResult<WalkedFrame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = match self.next.take()? {
            Ok(frame) => frame,
            Err(e) => return Some(Err(e)),
        };
        let walked = WalkedFrame {
            frame,
            map: self.map.clone(),
        };
        self.next = self.advance(&frame);
        Some(Ok(walked))
    }
}
