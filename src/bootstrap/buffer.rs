//! 부트스트랩 중인 테이블의 라이브 행 버퍼
//!
//! 메모리에는 `max_in_memory`개까지만 두고, 그 뒤로 들어오는 행은 임시 파일에
//! JSON 한 줄씩 덧붙인다. 꺼낼 때는 메모리 행, 파일 행 순서라 원래 순서가 유지된다.
//! 임시 파일은 버퍼가 drop될 때 지워진다.

use crate::error::{CdcError, Result};
use crate::events::RowMap;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use tracing::info;

/// 메모리에 둘 최대 행 수 기본값
pub const DEFAULT_MAX_IN_MEMORY: usize = 10_000;

enum Spill {
    Writing(BufWriter<File>),
    Reading(BufReader<File>),
}

pub struct RowBuffer {
    memory: VecDeque<RowMap>,
    max_in_memory: usize,
    spill: Option<Spill>,
    spilled: usize,
    len: usize,
}

impl RowBuffer {
    pub fn new(max_in_memory: usize) -> Self {
        RowBuffer {
            memory: VecDeque::new(),
            max_in_memory,
            spill: None,
            spilled: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 디스크로 넘어간 행 수
    pub fn spilled(&self) -> usize {
        self.spilled
    }

    /// 끝에 추가. 한번 디스크로 넘어가면 이후 행도 계속 디스크에 쓴다
    pub fn push(&mut self, row: RowMap) -> Result<()> {
        if self.spill.is_none() && self.memory.len() < self.max_in_memory {
            self.memory.push_back(row);
            self.len += 1;
            return Ok(());
        }

        if self.spill.is_none() {
            info!(
                "Row buffer for {}.{} exceeded {} rows, spilling to disk",
                row.database, row.table, self.max_in_memory
            );
            self.spill = Some(Spill::Writing(BufWriter::new(tempfile::tempfile()?)));
        }
        let Some(Spill::Writing(writer)) = &mut self.spill else {
            return Err(CdcError::Other("row buffer is being drained".to_string()));
        };
        serde_json::to_writer(&mut *writer, &row)?;
        writer.write_all(b"\n")?;
        self.spilled += 1;
        self.len += 1;
        Ok(())
    }

    /// 맨 앞 행을 꺼낸다. 첫 파일 읽기 전에 쓰기 버퍼를 비우고 처음으로 되감는다
    pub fn pop(&mut self) -> Result<Option<RowMap>> {
        if let Some(row) = self.memory.pop_front() {
            self.len -= 1;
            return Ok(Some(row));
        }

        if let Some(Spill::Writing(_)) = &self.spill {
            let Some(Spill::Writing(writer)) = self.spill.take() else {
                return Ok(None);
            };
            let mut file = writer.into_inner().map_err(|e| e.into_error())?;
            file.seek(SeekFrom::Start(0))?;
            self.spill = Some(Spill::Reading(BufReader::new(file)));
        }

        let Some(Spill::Reading(reader)) = &mut self.spill else {
            return Ok(None);
        };
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            self.spill = None;
            return Ok(None);
        }
        self.len -= 1;
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RowType;
    use crate::offset::Position;
    use serde_json::json;

    fn row(id: i64) -> RowMap {
        let mut row = RowMap::new("shop", "orders", RowType::Update, Position::at("bin.000001", id as u64));
        row.data.insert("id".into(), json!(id));
        row
    }

    #[test]
    fn test_spills_past_limit_and_keeps_order() {
        let mut buffer = RowBuffer::new(3);
        for id in 1..=10 {
            buffer.push(row(id)).unwrap();
        }
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.spilled(), 7);

        let mut ids = Vec::new();
        while let Some(row) = buffer.pop().unwrap() {
            ids.push(row.get("id").cloned().unwrap());
            assert_eq!(row.position.binlog.offset as usize, ids.len());
        }
        assert_eq!(ids, (1..=10).map(|id| json!(id)).collect::<Vec<_>>());
        assert!(buffer.is_empty());
        assert!(buffer.pop().unwrap().is_none());
    }

    #[test]
    fn test_memory_only() {
        let mut buffer = RowBuffer::new(DEFAULT_MAX_IN_MEMORY);
        buffer.push(row(1)).unwrap();
        buffer.push(row(2)).unwrap();
        assert_eq!(buffer.spilled(), 0);
        assert_eq!(buffer.pop().unwrap().unwrap().get("id"), Some(&json!(1)));
        assert_eq!(buffer.len(), 1);
    }
}
