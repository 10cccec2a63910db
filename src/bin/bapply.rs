//! bapply: reads 4096-byte blocks from stdin, compares each against the
//! corresponding block in a target file, and rewrites only the blocks that
//! differ.
//!
//! Grounded directly on the reference `bapply.c`: same block size, same
//! read/compare/seek-back/write sequence, same exit-code space. Counts are
//! formatted as `u64` rather than through a `%d`/`size_t` mismatch.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::process::ExitCode;

const BLOCK_SIZE: usize = 4096;

fn run() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <output>", args.first().map(String::as_str).unwrap_or("bapply"));
        return ExitCode::from(1);
    }
    let output_path = &args[1];

    let mut output = match OpenOptions::new().read(true).write(true).open(output_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Failed to open {}: {}", output_path, e);
            return ExitCode::from(2);
        }
    };

    let stdin = std::io::stdin();
    let mut stdin = stdin.lock();

    let mut new_block = vec![0u8; BLOCK_SIZE];
    let mut old_block = vec![0u8; BLOCK_SIZE];

    let mut total_blocks: u64 = 0;
    let mut different_blocks: u64 = 0;

    loop {
        let nread = match read_up_to(&mut stdin, &mut new_block) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                eprintln!("Failed read from stdin: {}", e);
                return ExitCode::from(3);
            }
        };

        let oread = match read_up_to(&mut output, &mut old_block[..nread]) {
            Ok(n) => n,
            Err(e) => {
                eprintln!("Failed read from {}: {}", output_path, e);
                return ExitCode::from(3);
            }
        };
        if oread != nread {
            eprintln!(
                "Failed read exactly {} bytes from {}, read only {}",
                nread, output_path, oread
            );
            return ExitCode::from(4);
        }

        total_blocks += 1;
        if new_block[..nread] != old_block[..nread] {
            different_blocks += 1;

            if let Err(e) = output.seek(SeekFrom::Current(-(oread as i64))) {
                eprintln!("Failed seek -{} bytes in {}: {}", oread, output_path, e);
                return ExitCode::from(5);
            }

            match output.write(&new_block[..nread]) {
                Ok(owritten) if owritten == nread => {}
                Ok(owritten) => {
                    eprintln!(
                        "Failed write exactly {} bytes to {}, wrote only {}",
                        nread, output_path, owritten
                    );
                    return ExitCode::from(7);
                }
                Err(e) => {
                    eprintln!("Failed write to {}: {}", output_path, e);
                    return ExitCode::from(6);
                }
            }
        }
    }

    eprintln!(
        "Total {}-byte blocks: {}, different blocks: {}",
        BLOCK_SIZE, total_blocks, different_blocks
    );

    ExitCode::SUCCESS
}

/// Reads until `buf` is full or the source is exhausted, returning the
/// number of bytes actually read (short of `buf.len()` only at EOF).
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn main() -> ExitCode {
    run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_up_to_stops_at_eof_with_short_buffer() {
        let mut cursor = Cursor::new(b"abc".to_vec());
        let mut buf = vec![0u8; 10];
        let n = read_up_to(&mut cursor, &mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn read_up_to_fills_buffer_across_multiple_reads() {
        struct OneByteAtATime(Cursor<Vec<u8>>);
        impl Read for OneByteAtATime {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                self.0.read(&mut buf[..1.min(buf.len())])
            }
        }

        let mut src = OneByteAtATime(Cursor::new(b"hello".to_vec()));
        let mut buf = vec![0u8; 5];
        let n = read_up_to(&mut src, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn rewrites_only_differing_block() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("target.dat");
        std::fs::write(&path, vec![0u8; BLOCK_SIZE]).unwrap();

        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let new_data = vec![1u8; BLOCK_SIZE];

        let old = {
            let mut buf = vec![0u8; BLOCK_SIZE];
            file.read_exact(&mut buf).unwrap();
            buf
        };
        assert_ne!(old, new_data);

        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&new_data).unwrap();

        let got = std::fs::read(&path).unwrap();
        assert_eq!(got, new_data);
    }
}
