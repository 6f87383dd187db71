//! 会话监管：轮次生命周期与中断
//!
//! 会话持有一个根 CancellationToken（断开连接时取消），每轮派生子 token；
//! 新一轮开始或用户打断时取消上一轮的 token，进行中的生成与未完成的派发随之停止。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SessionSupervisor {
    /// 断开连接时触发
    session_token: CancellationToken,
    /// 当前轮的 token
    turn_token: Mutex<Option<CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            session_token: CancellationToken::new(),
            turn_token: Mutex::new(None),
        }
    }

    pub fn session_token(&self) -> CancellationToken {
        self.session_token.clone()
    }

    /// 开始新一轮：取消上一轮并返回新的子 token
    pub fn begin_turn(&self) -> CancellationToken {
        let token = self.session_token.child_token();
        if let Ok(mut slot) = self.turn_token.lock() {
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }
        token
    }

    /// 取消当前轮（用户打断）；返回是否有进行中的轮被取消
    pub fn cancel_turn(&self) -> bool {
        match self.turn_token.lock() {
            Ok(mut slot) => match slot.take() {
                Some(token) if !token.is_cancelled() => {
                    token.cancel();
                    true
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    /// 断开连接：取消一切
    pub fn shutdown(&self) {
        self.session_token.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.session_token.is_cancelled()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
