use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineCmd {
    Stop,
}

/// Broadcast command channel: every posted command is numbered, receivers react to commands
/// posted after they were created.
#[derive(Clone)]
pub struct CmdChan {
    cmd: Arc<Mutex<(usize, Option<EngineCmd>)>>, // (msg_num, last posted command)
    condvar: Arc<Condvar>,
}

impl CmdChan {
    pub fn new() -> Self {
        Self {
            cmd: Arc::new(Mutex::new((0, None))),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn new_recvr(&self) -> CmdRecvr {
        // The first message a new receiver reacts to is `msg_num + 1`
        let (msg_num, _cmd_val) = &*self.cmd.lock();
        CmdRecvr {
            cmd: self.cmd.clone(),
            condvar: self.condvar.clone(),
            viewed_msg_num: *msg_num,
        }
    }

    pub fn send(&self, cmd: EngineCmd) {
        let mut mutex_guard = self.cmd.lock();
        let (msg_num, cmd_val) = &mut *mutex_guard;
        *cmd_val = Some(cmd);
        *msg_num += 1;
        self.condvar.notify_all();
    }
}

impl Default for CmdChan {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CmdRecvr {
    cmd: Arc<Mutex<(usize, Option<EngineCmd>)>>,
    condvar: Arc<Condvar>,
    viewed_msg_num: usize,
}

impl CmdRecvr {
    /// Latest command posted since the last one viewed, without blocking.
    pub fn try_recv(&mut self) -> Option<EngineCmd> {
        let (msg_num, cmd_val) = &*self.cmd.lock();
        if *msg_num == self.viewed_msg_num {
            return None;
        }
        self.viewed_msg_num = *msg_num;
        *cmd_val
    }

    /// Waits until `deadline` for a new command. Returns `None` if the deadline passed first.
    pub fn recv_until(&mut self, deadline: Instant) -> Option<EngineCmd> {
        let mut mutex_guard = self.cmd.lock();
        while mutex_guard.0 == self.viewed_msg_num {
            if self.condvar.wait_until(&mut mutex_guard, deadline).timed_out() {
                return None;
            }
        }
        let (msg_num, cmd_val) = &*mutex_guard;
        self.viewed_msg_num = *msg_num;
        *cmd_val
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<EngineCmd> {
        self.recv_until(Instant::now() + timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn receivers_ignore_commands_posted_before_them() {
        let chan = CmdChan::new();
        chan.send(EngineCmd::Stop);
        let mut recvr = chan.new_recvr();
        assert_eq!(recvr.try_recv(), None);
        chan.send(EngineCmd::Stop);
        assert_eq!(recvr.try_recv(), Some(EngineCmd::Stop));
        assert_eq!(recvr.try_recv(), None);
    }

    #[test]
    fn wait_is_interrupted_by_send() {
        let chan = CmdChan::new();
        let mut recvr = chan.new_recvr();
        let sender = chan.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sender.send(EngineCmd::Stop);
        });
        let started = Instant::now();
        assert_eq!(recvr.recv_timeout(Duration::from_secs(10)), Some(EngineCmd::Stop));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(recvr.recv_timeout(Duration::from_millis(5)), None);
    }
}
