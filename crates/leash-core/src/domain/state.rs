//! LeaseState - fetch lease の状態

use serde::{Deserialize, Serialize};

/// 状態遷移:
/// - Leased -> Acked   （エントリ削除）
/// - Leased -> Nacked  （lease 解放 + 通知 1 件）
///
/// Acked と Nacked は終端で、互いに排他。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseState {
    /// claim 済み、終端アクション未実行
    Leased,

    /// 消化済み
    Acked,

    /// キューに戻した
    Nacked,
}

impl LeaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LeaseState::Acked | LeaseState::Nacked)
    }
}
