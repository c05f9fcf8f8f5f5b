//! Sector-aligned raw reads and writes.
//!
//! Some kernels reject raw block I/O whose length is not a multiple of the
//! logical sector size. Requests of any length are accepted here, but only
//! whole sectors are ever passed to the provider: a short request is padded
//! up to the next sector boundary through a zero-filled scratch buffer.
//!
//! A transfer either moves every byte the caller asked for or reports zero.
//! A partial padded transfer is a total failure for that call, since the
//! caller cannot tell which of its own bytes made it to the device.

use crate::native::NativeProvider;
use tracing::warn;

/// Logical sector size of the raw devices handled by this crate.
pub const SECTOR_SIZE: usize = 512;

/// `len` rounded up to the next multiple of `sector_size`.
pub(crate) fn padded_len(len: usize, sector_size: usize) -> usize {
    match len % sector_size {
        0 => len,
        rem => len + (sector_size - rem),
    }
}

pub(crate) fn write_aligned<P: NativeProvider>(
    provider: &P,
    handle: &mut P::Handle,
    data: &[u8],
    sector_size: usize,
) -> usize {
    let len = data.len();
    let padded = padded_len(len, sector_size);

    let result = if padded == len {
        provider.write(handle, data)
    } else {
        let mut scratch = vec![0u8; padded];
        scratch[..len].copy_from_slice(data);
        provider.write(handle, &scratch)
    };

    match result {
        Ok(written) if written == padded => len,
        Ok(written) => {
            warn!(requested = padded, written, "short raw write");
            0
        }
        Err(e) => {
            warn!(requested = padded, error = %e, "raw write failed");
            0
        }
    }
}

pub(crate) fn read_aligned<P: NativeProvider>(
    provider: &P,
    handle: &mut P::Handle,
    buf: &mut [u8],
    sector_size: usize,
) -> usize {
    let len = buf.len();
    let padded = padded_len(len, sector_size);

    let result = if padded == len {
        provider.read(handle, buf)
    } else {
        let mut scratch = vec![0u8; padded];
        provider.read(handle, &mut scratch).map(|read| {
            if read == padded {
                buf.copy_from_slice(&scratch[..len]);
            }
            read
        })
    };

    match result {
        Ok(read) if read == padded => len,
        Ok(read) => {
            warn!(requested = padded, read, "short raw read");
            0
        }
        Err(e) => {
            warn!(requested = padded, error = %e, "raw read failed");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::OpenMode;
    use crate::testing::FakeProvider;
    use proptest::prelude::*;

    fn open(provider: &FakeProvider) -> <FakeProvider as NativeProvider>::Handle {
        match provider.open_raw("/dev/sdb", OpenMode::ReadWrite, false) {
            Ok(handle) => handle,
            Err(e) => panic!("fake open failed: {e}"),
        }
    }

    #[test]
    fn padded_len_rounds_up_to_sector() {
        assert_eq!(padded_len(1, 512), 512);
        assert_eq!(padded_len(100, 512), 512);
        assert_eq!(padded_len(512, 512), 512);
        assert_eq!(padded_len(513, 512), 1024);
        assert_eq!(padded_len(4096, 512), 4096);
    }

    #[test]
    fn short_write_is_padded_with_zeros() {
        let provider = FakeProvider::new();
        let mut handle = open(&provider);
        let data: Vec<u8> = (1..=100).collect();

        assert_eq!(write_aligned(&provider, &mut handle, &data, SECTOR_SIZE), 100);

        let state = provider.state.lock().unwrap();
        assert_eq!(state.writes.len(), 1);
        let issued = &state.writes[0];
        assert_eq!(issued.len(), 512);
        assert_eq!(&issued[..100], &data[..]);
        assert!(issued[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn aligned_write_goes_through_unchanged() {
        let provider = FakeProvider::new();
        let mut handle = open(&provider);
        let data = vec![0xAB; 1024];

        assert_eq!(write_aligned(&provider, &mut handle, &data, SECTOR_SIZE), 1024);
        assert_eq!(provider.state.lock().unwrap().writes, vec![data]);
    }

    #[test]
    fn partial_padded_write_reports_nothing_written() {
        let provider = FakeProvider::new();
        provider.state.lock().unwrap().transfer_limit = Some(256);
        let mut handle = open(&provider);

        assert_eq!(write_aligned(&provider, &mut handle, &[7u8; 300], SECTOR_SIZE), 0);
        assert_eq!(write_aligned(&provider, &mut handle, &[7u8; 512], SECTOR_SIZE), 0);
    }

    #[test]
    fn short_read_uses_one_padded_request() {
        let provider = FakeProvider::new();
        provider.state.lock().unwrap().disk = (0..1024).map(|i| (i % 251) as u8).collect();
        let mut handle = open(&provider);
        let mut buf = [0u8; 10];

        assert_eq!(read_aligned(&provider, &mut handle, &mut buf, SECTOR_SIZE), 10);
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(provider.state.lock().unwrap().reads, vec![512]);
    }

    #[test]
    fn read_past_the_end_reports_nothing_and_leaves_buffer() {
        let provider = FakeProvider::new();
        provider.state.lock().unwrap().disk = vec![1u8; 100];
        let mut handle = open(&provider);
        let mut buf = [9u8; 50];

        assert_eq!(read_aligned(&provider, &mut handle, &mut buf, SECTOR_SIZE), 0);
        assert!(buf.iter().all(|&b| b == 9));
    }

    #[test]
    fn every_length_up_to_4096_round_trips() {
        for len in 1..=4096usize {
            let provider = FakeProvider::new();
            let mut handle = open(&provider);
            let data: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();

            assert_eq!(write_aligned(&provider, &mut handle, &data, SECTOR_SIZE), len);
            provider.seek(&mut handle, 0).unwrap();
            let mut back = vec![0u8; len];
            assert_eq!(read_aligned(&provider, &mut handle, &mut back, SECTOR_SIZE), len);
            assert_eq!(back, data, "length {len}");
        }
    }

    proptest! {
        #[test]
        fn round_trip_at_any_sector_offset(
            data in proptest::collection::vec(any::<u8>(), 1..=4096usize),
            sector in 0u64..64,
        ) {
            let provider = FakeProvider::new();
            let mut handle = open(&provider);
            let offset = sector * SECTOR_SIZE as u64;

            provider.seek(&mut handle, offset).unwrap();
            prop_assert_eq!(write_aligned(&provider, &mut handle, &data, SECTOR_SIZE), data.len());

            provider.seek(&mut handle, offset).unwrap();
            let mut back = vec![0u8; data.len()];
            prop_assert_eq!(read_aligned(&provider, &mut handle, &mut back, SECTOR_SIZE), data.len());
            prop_assert_eq!(back, data);
        }
    }
}
