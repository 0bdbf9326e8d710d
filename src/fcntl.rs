use bitflags::bitflags;

bitflags! {
    pub struct OpenFlags: i32 {
        const O_RDONLY = 0;
        const O_WRONLY = 0x1;
        const O_RDWR = 0x2;
        const O_CREATE = 0x200;
    }
}

impl OpenFlags {
    /// The accepted modes: RDONLY, WRONLY, RDWR, or CREATE|RDWR.
    pub(crate) fn valid(self) -> bool {
        matches!(
            self.bits(),
            0 | 0x1 | 0x2 | 0x202
        )
    }

    pub(crate) fn readable(self) -> bool {
        self.bits() & 0x3 != Self::O_WRONLY.bits()
    }

    pub(crate) fn writable(self) -> bool {
        self.bits() & 0x3 != Self::O_RDONLY.bits()
    }

    pub(crate) fn creates(self) -> bool {
        self.bits() & 0x200 != 0
    }
}
