//! Frame pointer walker. Trusts the `{previous fp, return address}` pair
//! every frame conventionally starts with.

use crate::arch::{Registers, Step};
use crate::error::Result;
use crate::memory::{self, Memory, WORD_SIZE};

pub fn step<R: Registers, M: Memory>(registers: &R, memory: &M) -> Result<Step<R>> {
    let fp = memory::check(R::strip_pointer(registers.fp()))?;

    let previous = R::strip_pointer(memory.read_word(fp)?);
    trace!("walk... fp={fp:#x} previous={previous:#x}");
    if previous == 0 {
        return Ok(Step::EndOfStack);
    }
    // A wild previous frame means the stack is corrupt from here on.
    memory::check(previous)?;

    let return_address = R::strip_pointer(memory.read_word(fp + WORD_SIZE)?);
    trace!("walk... return_addr={return_address:#x}");

    let mut caller = registers.clone();
    caller.set_fp(R::sign_pointer(previous));
    caller.set_ip(return_address);
    caller.set_sp(R::sign_pointer(fp + 2 * WORD_SIZE));
    Ok(Step::Caller(caller))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64Registers;
    use crate::error::Error;
    use crate::memory::testing::FakeStack;

    #[test]
    fn follows_one_link() {
        let mut stack = FakeStack::new(0x7ff0_0000, 8);
        stack.set(2, stack.addr(6));
        stack.set(3, 0x40_1234);

        let mut registers = X86_64Registers::default();
        registers.set_fp(stack.addr(2));

        let Ok(Step::Caller(caller)) = step(&registers, &stack) else {
            panic!();
        };
        assert_eq!(caller.fp(), stack.addr(6));
        assert_eq!(caller.ip(), 0x40_1234);
        assert_eq!(caller.sp(), stack.addr(4));
    }

    #[test]
    fn zero_previous_is_the_end() {
        let stack = FakeStack::new(0x7ff0_0000, 8);
        let mut registers = X86_64Registers::default();
        registers.set_fp(stack.addr(2));
        assert_eq!(step(&registers, &stack), Ok(Step::EndOfStack));
    }

    #[test]
    fn wild_pointers_are_rejected_before_loading() {
        let mut stack = FakeStack::new(0x7ff0_0000, 8);
        let mut registers = X86_64Registers::default();

        registers.set_fp(0x8);
        assert_eq!(step(&registers, &stack), Err(Error::PointerInvalid(0x8)));
        registers.set_fp(usize::MAX - 0x10);
        assert_eq!(
            step(&registers, &stack),
            Err(Error::PointerInvalid(usize::MAX - 0x10))
        );
        assert!(stack.loads.borrow().is_empty());

        // The link itself is garbage: stop without reading the return address.
        stack.set(2, 0x20);
        registers.set_fp(stack.addr(2));
        assert_eq!(step(&registers, &stack), Err(Error::PointerInvalid(0x20)));
        assert_eq!(*stack.loads.borrow(), [stack.addr(2)]);
    }
}
