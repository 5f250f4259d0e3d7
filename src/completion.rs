use std::fmt;

use crate::error::{Error, Result};
use crate::queue::Qd;
use crate::sga::Sga;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Push,
    Pop,
    Accept,
    Connect,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Accept => "accept",
            Opcode::Connect => "connect",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum QValue {
    Sga(Sga),       // popped data, or a pushed buffer handed back by the transport
    Accept(Qd),     // the new connection
    Empty,
}

/// The outcome of one token.
#[derive(Debug)]
pub struct QResult {
    pub opcode: Opcode,
    pub qd: Qd, // the queue the operation was issued on
    pub value: Result<QValue>,
}

impl QResult {
    pub fn new(opcode: Opcode, qd: Qd, value: Result<QValue>) -> Self {
        Self { opcode, qd, value }
    }

    pub(crate) fn aborted(opcode: Opcode, qd: Qd) -> Self {
        Self::new(opcode, qd, Err(Error::ConnectionAborted))
    }

    pub fn is_ok(&self) -> bool {
        self.value.is_ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.value.as_ref().err()
    }

    /// The buffer carried by a pop, or returned by a network push.
    pub fn into_sga(self) -> Result<Sga> {
        match self.value? {
            QValue::Sga(sga) => Ok(sga),
            _ => Err(Error::Mismatch {
                opcode: self.opcode,
                expected: "buffer",
            }),
        }
    }

    /// The descriptor of an accepted connection.
    pub fn into_accepted(self) -> Result<Qd> {
        match self.value? {
            QValue::Accept(qd) => Ok(qd),
            _ => Err(Error::Mismatch {
                opcode: self.opcode,
                expected: "connection",
            }),
        }
    }
}
