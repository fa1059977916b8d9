//! The process-wide load-then-execute session.
//!
//! At most one image may be under construction or staged at any time. The
//! whole protocol runs under one coarse lock: [`Session::try_acquire`]
//! either grants a [`SessionGuard`] or reports that another session is in
//! flight, and the guard's operations drive the image through
//! `Idle -> Loaded -> Executing`. There is no rollback past
//! [`SessionGuard::execute`]; before it, [`SessionGuard::discard`] is
//! always safe and is the only cancellation path.
use core::cell::UnsafeCell;
use core::convert::Infallible;
use core::hint;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use alloc::vec::Vec;

use imago_core::addr::PhysAddr;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::host::{Executor, HostError, HostInterface, HostMemory};
use crate::image::{Image, LoadError};
use crate::segment::{Provenance, Segment, SourceBuffer};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("another load-execute session is in flight")]
    Busy,
    #[error("no image is staged")]
    NothingStaged,
    #[error("host refused the image: {0}")]
    Rejected(HostError),
    #[error("load failed: {0}")]
    Load(LoadError),
}

impl From<HostError> for SessionError {
    fn from(error: HostError) -> Self {
        Self::Rejected(error)
    }
}

impl From<LoadError> for SessionError {
    fn from(error: LoadError) -> Self {
        Self::Load(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Loaded = 1,
    Executing = 2,
}

/// Singleton session. The embedder creates exactly one, typically as a
/// `static`.
pub struct Session {
    locked: AtomicBool,
    state: AtomicU8,
    image: UnsafeCell<Option<Image>>,
}

// The lock serializes all access to `image`; `state` is a plain atomic.
unsafe impl Send for Session {}
unsafe impl Sync for Session {}

impl Session {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            state: AtomicU8::new(SessionState::Idle as u8),
            image: UnsafeCell::new(None),
        }
    }

    #[must_use]
    /// Current protocol state, readable without the lock.
    pub fn state(&self) -> SessionState {
        SessionState::try_from(self.state.load(Ordering::Acquire)).unwrap()
    }

    #[must_use]
    /// Whether an image is staged and ready to execute.
    pub fn is_loaded(&self) -> bool {
        self.state() == SessionState::Loaded
    }

    /// Claim the session, failing immediately if it is held elsewhere.
    pub fn try_acquire(&self) -> Result<SessionGuard<'_>, SessionError> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(SessionGuard { session: self })
        } else {
            Err(SessionError::Busy)
        }
    }

    /// Claim the session, spinning until it is free.
    pub fn acquire(&self) -> SessionGuard<'_> {
        loop {
            if let Ok(guard) = self.try_acquire() {
                return guard;
            }
            hint::spin_loop();
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state.into(), Ordering::Release);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to the session for the guard's lifetime.
pub struct SessionGuard<'a> {
    session: &'a Session,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.session.locked.store(false, Ordering::Release);
    }
}

impl SessionGuard<'_> {
    fn image_slot(&mut self) -> &mut Option<Image> {
        // Exclusive: the lock is held for the guard's lifetime.
        unsafe { &mut *self.session.image.get() }
    }

    #[must_use]
    /// Read-only view of the staged image, for diagnostics.
    pub fn image(&self) -> Option<&Image> {
        unsafe { (*self.session.image.get()).as_ref() }
    }

    /// Validate, stage and finalize a new image.
    ///
    /// Rejected with [`SessionError::Busy`] while an image is already
    /// staged; on any failure the partial image is torn down and the
    /// session stays `Idle`.
    pub fn load<M: HostMemory, X: Executor, S: SourceBuffer + ?Sized>(
        &mut self,
        host: &mut HostInterface<M, X>,
        start: PhysAddr,
        provenance: Provenance,
        segments: &[(Segment, &S)],
    ) -> Result<(), SessionError> {
        if self.session.state() != SessionState::Idle {
            return Err(SessionError::Busy);
        }

        let layout: Vec<Segment> = segments.iter().map(|(segment, _)| *segment).collect();
        let (memory, executor) = host.parts();

        let mut image = Image::new(memory, start, provenance, layout)?;
        match Self::fill(&mut image, memory, executor, segments) {
            Ok(()) => {
                *self.image_slot() = Some(image);
                self.session.set_state(SessionState::Loaded);
                Ok(())
            }
            Err(error) => {
                image.release(memory, executor);
                Err(error)
            }
        }
    }

    fn fill<M: HostMemory, X: Executor, S: SourceBuffer + ?Sized>(
        image: &mut Image,
        memory: &mut M,
        executor: &mut X,
        segments: &[(Segment, &S)],
    ) -> Result<(), SessionError> {
        executor.prepare(image)?;
        for (index, (_, source)) in segments.iter().enumerate() {
            image.load_segment(memory, index, *source)?;
        }
        image.finalize(memory)?;
        image.log_info();
        Ok(())
    }

    /// Tear down the staged image.
    pub fn discard<M: HostMemory, X: Executor>(
        &mut self,
        host: &mut HostInterface<M, X>,
    ) -> Result<(), SessionError> {
        let Some(image) = self.image_slot().take() else {
            return Err(SessionError::NothingStaged);
        };
        let (memory, executor) = host.parts();
        image.release(memory, executor);
        self.session.set_state(SessionState::Idle);
        Ok(())
    }

    /// Hand the machine over to the staged image.
    ///
    /// This is the point of no return: other execution units are shut
    /// down, and a violated quiesce precondition past that is fatal, since
    /// the services needed to unwind are already gone.
    pub fn execute<M: HostMemory, X: Executor>(
        &mut self,
        host: &mut HostInterface<M, X>,
    ) -> Result<Infallible, SessionError> {
        if self.session.state() != SessionState::Loaded {
            return Err(SessionError::NothingStaged);
        }
        let Some(image) = self.image_slot().take() else {
            return Err(SessionError::NothingStaged);
        };
        let (_, executor) = host.parts();

        log::info!(
            "starting replacement image at {:#x}",
            image.start().as_u64()
        );
        executor.quiesce();
        self.session.set_state(SessionState::Executing);
        assert!(
            executor.is_quiesced(),
            "execution units still running at handoff"
        );
        executor.flush(&image);
        executor.jump(&image)
    }
}
