// 该文件是 Yuanwang （远望） 项目的一部分。
// src/transport/wire.rs - 传输层消息分帧
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::io::{self, Read, Write};

/// 客户端请求负载，服务端只检查其非空
pub const HANDSHAKE: &[u8] = b"Hello\0";

/// 单条消息的上限，超过即视为对端数据损坏
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// 写出一条消息：4 字节大端长度 + 负载
pub fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
  let len = u32::try_from(payload.len())
    .ok()
    .filter(|&len| len as usize <= MAX_MESSAGE_LEN)
    .ok_or_else(|| {
      io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("消息过长: {} 字节", payload.len()),
      )
    })?;
  writer.write_all(&len.to_be_bytes())?;
  writer.write_all(payload)?;
  writer.flush()
}

/// 读取一条完整消息，要么得到整条负载，要么返回错误
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
  let mut header = [0u8; 4];
  reader.read_exact(&mut header)?;
  let len = u32::from_be_bytes(header) as usize;
  if len > MAX_MESSAGE_LEN {
    return Err(io::Error::new(
      io::ErrorKind::InvalidData,
      format!("消息长度 {} 超过上限 {}", len, MAX_MESSAGE_LEN),
    ));
  }
  let mut payload = vec![0u8; len];
  reader.read_exact(&mut payload)?;
  Ok(payload)
}

/// 超时类错误在不同平台上表现为 `WouldBlock` 或 `TimedOut`
pub fn is_timeout(err: &io::Error) -> bool {
  matches!(
    err.kind(),
    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[test]
  fn message_framing() {
    let mut buffer = Vec::new();
    write_message(&mut buffer, HANDSHAKE).unwrap();
    write_message(&mut buffer, &[]).unwrap();
    assert_eq!(&buffer[..4], &[0, 0, 0, 6]);

    let mut cursor = Cursor::new(buffer);
    assert_eq!(read_message(&mut cursor).unwrap(), HANDSHAKE);
    assert!(read_message(&mut cursor).unwrap().is_empty());
    let eof = read_message(&mut cursor).unwrap_err();
    assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
  }

  #[test]
  fn truncated_and_oversized_messages_fail() {
    let mut cursor = Cursor::new(vec![0, 0, 0, 10, 1, 2, 3]);
    assert!(read_message(&mut cursor).is_err());

    let mut cursor = Cursor::new(u32::MAX.to_be_bytes().to_vec());
    let err = read_message(&mut cursor).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
  }
}
