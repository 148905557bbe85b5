//! 读取游标
//!
//! 每次轮询根据终止指针决定下一步：无新数据、顺序读取、缓冲区重置后从起点读取，
//! 或者写入方已超过一整圈、未读数据被覆盖。

/// 一次读取的逻辑区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailPlan {
    pub start: u64,
    pub end: u64,
    /// 终止指针回退，缓冲区被重新初始化
    pub reset: bool,
    /// 被覆盖而无法读取的字节数
    pub lost: u64,
}

impl TailPlan {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStep {
    Idle,
    Read(TailPlan),
    /// 终止指针落在缓冲区起点之前，区域已失效
    OutOfRange { terminal: u64 },
}

/// 已读取位置，以及读到但尚未形成完整条目的尾部字节
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailCursor {
    from: u64,
    pending: Vec<u8>,
}

impl TailCursor {
    pub fn new(entry_pointer: u64) -> Self {
        Self { from: entry_pointer, pending: Vec::new() }
    }

    pub fn position(&self) -> u64 {
        self.from
    }

    /// 紧邻 `position()` 之前、尚未切分出条目的字节
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn plan(&self, entry_pointer: u64, capacity: u64, terminal: u64) -> CursorStep {
        if terminal == self.from {
            return CursorStep::Idle;
        }
        if terminal < entry_pointer {
            return CursorStep::OutOfRange { terminal };
        }

        let (mut start, reset) = if terminal < self.from {
            (entry_pointer, true)
        } else {
            (self.from, false)
        };

        let mut lost = 0;
        if capacity > 0 && terminal - start > capacity {
            lost = terminal - start - capacity;
            start = terminal - capacity;
        }

        CursorStep::Read(TailPlan { start, end: terminal, reset, lost })
    }

    /// 读取完成后推进，并记下未写完的尾部
    pub fn commit(&mut self, plan: &TailPlan, pending: Vec<u8>) {
        self.from = plan.end;
        self.pending = pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_new_data_is_idle() {
        let cursor = TailCursor::new(0);
        assert_eq!(cursor.plan(0, 1024, 0), CursorStep::Idle);
    }

    #[test]
    fn test_sequential_reads_do_not_overlap() {
        let mut cursor = TailCursor::new(0);
        let CursorStep::Read(first) = cursor.plan(0, 1024, 100) else { panic!("expected read") };
        assert_eq!((first.start, first.end, first.reset, first.lost), (0, 100, false, 0));
        cursor.commit(&first, Vec::new());

        let CursorStep::Read(second) = cursor.plan(0, 1024, 250) else { panic!("expected read") };
        assert_eq!((second.start, second.end), (100, 250));
        cursor.commit(&second, Vec::new());
        assert_eq!(cursor.plan(0, 1024, 250), CursorStep::Idle);
    }

    #[test]
    fn test_backward_terminal_is_reset() {
        let mut cursor = TailCursor::new(0);
        cursor.commit(&TailPlan { start: 0, end: 900, reset: false, lost: 0 }, Vec::new());

        let CursorStep::Read(plan) = cursor.plan(0, 1024, 20) else { panic!("expected read") };
        assert_eq!((plan.start, plan.end, plan.reset, plan.lost), (0, 20, true, 0));

        // 重置后恰好为空也需要移动游标
        let CursorStep::Read(empty) = cursor.plan(0, 1024, 0) else { panic!("expected read") };
        assert!(empty.is_empty() && empty.reset);
    }

    #[test]
    fn test_overrun_reports_lost_bytes() {
        let mut cursor = TailCursor::new(0);
        cursor.commit(&TailPlan { start: 0, end: 100, reset: false, lost: 0 }, b"par".to_vec());
        assert_eq!(cursor.pending(), b"par");

        let CursorStep::Read(plan) = cursor.plan(0, 1024, 3000) else { panic!("expected read") };
        assert_eq!(plan.lost, 3000 - 100 - 1024);
        assert_eq!(plan.start, 3000 - 1024);
        assert_eq!(plan.len(), 1024);
    }

    #[test]
    fn test_linear_buffer_never_loses() {
        let cursor = TailCursor::new(4096);
        let CursorStep::Read(plan) = cursor.plan(4096, 0, 1 << 20) else { panic!("expected read") };
        assert_eq!(plan.lost, 0);
        assert_eq!(plan.start, 4096);
    }

    #[test]
    fn test_terminal_before_entry_is_out_of_range() {
        let cursor = TailCursor::new(4096);
        assert_eq!(cursor.plan(4096, 1024, 100), CursorStep::OutOfRange { terminal: 100 });
    }
}
