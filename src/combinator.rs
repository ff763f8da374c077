//! Whole-buffer transfer loops and the accept-serve loop.
//!
//! Thin compositions over the core contracts: each awaits the
//! single-transfer operations in a loop, advancing a
//! [`ConsumingBuffers`] cursor between attempts.

use crate::buffer::{BufferArray, ConstBufferSequence, ConsumingBuffers, MutableBufferSequence};
use crate::error::Result;
use crate::exec::{async_run, Executor};
use crate::net::{Acceptor, Socket};
use std::future::Future;

/// Reads until the buffer sequence is full, EOF, or an error.
///
/// Returns the number of bytes read on success (the full sequence
/// size). EOF before the sequence is full surfaces as `Err(Eof)`.
pub async fn read<B>(socket: &Socket, bufs: &mut B) -> Result<usize>
where
    B: MutableBufferSequence + ?Sized,
{
    let total = {
        let mut probe = BufferArray::new();
        bufs.copy_to(&mut probe);
        probe.total_len()
    };
    let mut consuming = ConsumingBuffers::new(bufs);
    let mut done = 0;
    while done < total {
        let n = socket.read_some(&mut consuming).await?;
        consuming.consume(n);
        done += n;
    }
    Ok(done)
}

/// Writes the entire buffer sequence.
pub async fn write_all<B>(socket: &Socket, bufs: &B) -> Result<usize>
where
    B: ConstBufferSequence + ?Sized,
{
    let total = {
        let mut probe = BufferArray::new();
        bufs.copy_to(&mut probe);
        probe.total_len()
    };
    // The const sequence is not mutated; the cursor wrapper only
    // tracks how far the writes have progressed.
    let mut window = WriteWindow { bufs, consumed: 0 };
    let mut done = 0;
    while done < total {
        let n = socket.write_some(&window).await?;
        window.consumed += n;
        done += n;
    }
    Ok(done)
}

struct WriteWindow<'a, B: ?Sized> {
    bufs: &'a B,
    consumed: usize,
}

impl<B> ConstBufferSequence for WriteWindow<'_, B>
where
    B: ConstBufferSequence + ?Sized,
{
    fn copy_to(&self, dest: &mut BufferArray) {
        let mut all = BufferArray::new();
        self.bufs.copy_to(&mut all);
        all.advance(self.consumed);
        for desc in all.descriptors() {
            // Safety-wise this is a plain descriptor copy; the write
            // path never stores through the pointers.
            if !dest.push_const(unsafe { std::slice::from_raw_parts(desc.ptr, desc.len) }) {
                break;
            }
        }
    }
}

/// Accepts connections in a loop, spawning one handler task per peer.
///
/// Returns `Ok(())` when the acceptor is cancelled or closed, and the
/// error otherwise.
pub async fn serve<F, Fut>(ex: &Executor, acceptor: &Acceptor, handler: F) -> Result<()>
where
    F: Fn(Socket) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        match acceptor.accept().await {
            Ok(peer) => async_run(ex, handler(peer)),
            Err(err) if err.is_canceled() => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

// Exercised end-to-end in tests/echo.rs and tests/cancel.rs; the
// loops have no behavior separable from live sockets.
