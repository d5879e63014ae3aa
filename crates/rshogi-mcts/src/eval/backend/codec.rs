//! ソケット転送プロトコル
//!
//! 要求: `count: u32 LE` + `count * sample_size` 個の f32 LE
//! 応答: `count: u32 LE` + `count * (policy_size + value_size)` 個の f32 LE
//!       （サンプルごとに policy, value の順）

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{BackendError, BackendShape};

/// 1フレームのサンプル数上限
pub const MAX_FRAME_BATCH: u32 = 65536;

/// 要求フレームを書く
pub fn write_request<W: Write>(w: &mut W, count: u32, features: &[f32]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(count)?;
    write_floats(w, features)?;
    w.flush()
}

/// 要求フレームを読む。先頭の count で EOF なら None（正常終了）
pub fn read_request<R: Read>(r: &mut R, sample_size: usize, out: &mut Vec<f32>) -> Result<Option<u32>, BackendError> {
    let Some(count) = read_count_or_eof(r)? else {
        return Ok(None);
    };
    read_floats(r, count as usize * sample_size, out)?;
    Ok(Some(count))
}

/// 応答フレームを書く（`payload` はサンプルごとに policy → value の並び）
pub fn write_response<W: Write>(w: &mut W, count: u32, payload: &[f32]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(count)?;
    write_floats(w, payload)?;
    w.flush()
}

/// 応答フレームを読む。件数が `expected` と違えばプロトコル違反
pub fn read_response<R: Read>(
    r: &mut R,
    expected: u32,
    shape: &BackendShape,
    out: &mut Vec<f32>,
) -> Result<(), BackendError> {
    let count = read_count_or_eof(r)?.ok_or(BackendError::Closed)?;
    if count != expected {
        return Err(BackendError::Protocol(format!(
            "response carries {count} samples, expected {expected}"
        )));
    }
    read_floats(r, count as usize * shape.output_size(), out)
}

fn read_count_or_eof<R: Read>(r: &mut R) -> Result<Option<u32>, BackendError> {
    let mut bytes = [0u8; 4];
    let mut off = 0;
    while off < bytes.len() {
        match r.read(&mut bytes[off..]) {
            Ok(0) if off == 0 => return Ok(None),
            Ok(0) => return Err(BackendError::Closed),
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    let count = u32::from_le_bytes(bytes);
    if count > MAX_FRAME_BATCH {
        return Err(BackendError::Protocol(format!("frame batch {count} exceeds {MAX_FRAME_BATCH}")));
    }
    Ok(Some(count))
}

fn write_floats<W: Write>(w: &mut W, values: &[f32]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for &v in values {
        buf.write_f32::<LittleEndian>(v)?;
    }
    w.write_all(&buf)
}

fn read_floats<R: Read>(r: &mut R, len: usize, out: &mut Vec<f32>) -> Result<(), BackendError> {
    out.clear();
    out.resize(len, 0.0);
    r.read_f32_into::<LittleEndian>(out).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            BackendError::Closed
        } else {
            BackendError::Io(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_request_frame_layout() {
        let mut buf = Vec::new();
        write_request(&mut buf, 2, &[1.0, -2.0]).unwrap();
        assert_eq!(&buf[..4], &[2, 0, 0, 0]);
        assert_eq!(&buf[4..8], &1.0f32.to_le_bytes());
        assert_eq!(&buf[8..12], &(-2.0f32).to_le_bytes());

        let mut out = Vec::new();
        let count = read_request(&mut Cursor::new(buf), 1, &mut out).unwrap();
        assert_eq!(count, Some(2));
        assert_eq!(out, vec![1.0, -2.0]);
    }

    #[test]
    fn test_clean_eof_ends_session() {
        let mut out = Vec::new();
        let count = read_request(&mut Cursor::new(Vec::<u8>::new()), 4, &mut out).unwrap();
        assert_eq!(count, None);
    }

    #[test]
    fn test_truncated_frame_is_closed() {
        let mut buf = Vec::new();
        write_request(&mut buf, 1, &[1.0, 2.0, 3.0]).unwrap();
        buf.truncate(buf.len() - 2);
        let mut out = Vec::new();
        let err = read_request(&mut Cursor::new(buf), 3, &mut out).unwrap_err();
        assert!(matches!(err, BackendError::Closed), "got {err:?}");
    }

    #[test]
    fn test_response_count_mismatch() {
        let shape = BackendShape::new(1, 1);
        let mut buf = Vec::new();
        write_response(&mut buf, 1, &[0.0, 0.0, 0.0]).unwrap();
        let mut out = Vec::new();
        let err = read_response(&mut Cursor::new(buf), 2, &shape, &mut out).unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)), "got {err:?}");
    }

    #[test]
    fn test_oversized_count_rejected() {
        let buf = (MAX_FRAME_BATCH + 1).to_le_bytes().to_vec();
        let mut out = Vec::new();
        let err = read_request(&mut Cursor::new(buf), 1, &mut out).unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)), "got {err:?}");
    }
}
