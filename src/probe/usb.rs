//! Blocking bulk-transfer helpers over nusb's async API.

use std::io;
use std::time::Duration;

use async_io::block_on;
use futures_lite::FutureExt;
use nusb::transfer::RequestBuffer;
use nusb::Interface;

pub trait InterfaceExt {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> io::Result<usize>;
}

impl InterfaceExt for Interface {
    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> io::Result<usize> {
        block_on(
            async {
                let comp = self.bulk_out(endpoint, buf.to_vec()).await;
                comp.status.map_err(io::Error::other)?;
                Ok(comp.data.actual_length())
            }
            .or(async {
                async_io::Timer::after(timeout).await;
                Err(io::ErrorKind::TimedOut.into())
            }),
        )
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        block_on(
            async {
                let comp = self.bulk_in(endpoint, RequestBuffer::new(buf.len())).await;
                comp.status.map_err(io::Error::other)?;

                let n = comp.data.len();
                buf[..n].copy_from_slice(&comp.data);
                Ok(n)
            }
            .or(async {
                async_io::Timer::after(timeout).await;
                Err(io::ErrorKind::TimedOut.into())
            }),
        )
    }
}
