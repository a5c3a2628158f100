//! Abstract machine description.
//!
//! The allocator never hard-codes a target. Everything it needs to know about
//! registers comes through the [`TargetIsa`] trait: which registers exist,
//! which register mask each ideal register class may use, where stack slots
//! begin in the register numbering, pressure limits, and the save policy of
//! each register. Concrete machine descriptions live with the instruction
//! matcher, outside this crate; [`test_utils`] provides a small synthetic
//! target for the test suites.

pub mod registers;
pub mod test_utils;

pub use self::registers::{regs_overlap, RegMask, RegUnit, SPILL_REG};

/// The ideal register class of a value.
///
/// This classifies what kind of register file a value wants, independently of
/// the concrete registers the matcher allows for a particular operand. The
/// allocator uses it to size live ranges (pairs, vector sets) and to split
/// register pressure into integer-like and float-like banks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegClass {
    /// 32-bit integer.
    Int,
    /// 64-bit integer pair.
    Long,
    /// Single-precision float.
    Float,
    /// Double-precision float pair.
    Double,
    /// Pointer (possibly a heap reference).
    Ptr,
    /// Condition flags. Not spillable.
    Flags,
    /// 32-bit vector.
    VecS,
    /// 64-bit vector.
    VecD,
    /// 128-bit vector.
    VecX,
    /// 256-bit vector.
    VecY,
    /// 512-bit vector.
    VecZ,
    /// Scalable vector; physical size only known at spill time.
    VecA,
    /// Vector predicate mask register.
    PredMask,
    /// Multi-register kill set produced by calls and similar effects. Values
    /// of this class need neither adjacency nor alignment.
    KillSet,
}

impl RegClass {
    /// All classes, in table order.
    pub const ALL: [RegClass; 14] = [
        RegClass::Int,
        RegClass::Long,
        RegClass::Float,
        RegClass::Double,
        RegClass::Ptr,
        RegClass::Flags,
        RegClass::VecS,
        RegClass::VecD,
        RegClass::VecX,
        RegClass::VecY,
        RegClass::VecZ,
        RegClass::VecA,
        RegClass::PredMask,
        RegClass::KillSet,
    ];

    /// Index of this class in per-class tables.
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|&c| c == self).unwrap()
    }

    /// Is this one of the vector classes?
    pub fn is_vector(self) -> bool {
        matches!(
            self,
            RegClass::VecS
                | RegClass::VecD
                | RegClass::VecX
                | RegClass::VecY
                | RegClass::VecZ
                | RegClass::VecA
        )
    }
}

/// What the calling convention requires of a register across calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SavePolicy {
    /// Caller-save; calls clobber it.
    CallerSave,
    /// Callee-save; preserved across calls, must be saved on entry if used.
    CalleeSave,
    /// Always saved by the runtime, e.g. the frame pointer.
    AlwaysSave,
    /// Not preserved and not allocatable across calls.
    NoSave,
}

/// Queries the allocator makes against the machine description.
pub trait TargetIsa {
    /// Short name of this target, for logging.
    fn name(&self) -> &'static str;

    /// Number of integer-like live ranges that constitute high register
    /// pressure.
    fn int_pressure_limit(&self) -> u32;

    /// Number of float-like live ranges that constitute high register
    /// pressure.
    fn float_pressure_limit(&self) -> u32;

    /// All allocatable hardware registers.
    fn allocatable(&self) -> &RegMask;

    /// Registers a value of class `class` may occupy.
    fn reg_mask(&self, class: RegClass) -> &RegMask;

    /// Registers *and stack slots* a spilled value of class `class` may
    /// occupy. Empty for classes that cannot be spilled at all.
    fn spill_mask(&self, class: RegClass) -> &RegMask;

    /// First stack-slot number. Everything at or above this is a frame
    /// location rather than a hardware register.
    fn stack_base(&self) -> RegUnit;

    /// Register number of the frame pointer.
    fn frame_pointer(&self) -> RegUnit;

    /// Required frame alignment, in stack slots.
    fn stack_alignment_slots(&self) -> u32 {
        2
    }

    /// Save policy of `reg`.
    fn register_save_policy(&self, reg: RegUnit) -> SavePolicy;

    /// Is `reg` preserved across function entry (callee-save)?
    fn is_save_on_entry(&self, reg: RegUnit) -> bool {
        self.register_save_policy(reg) == SavePolicy::CalleeSave
    }

    /// Number of callee-save registers.
    fn number_of_saved_registers(&self) -> u32 {
        self.allocatable()
            .iter()
            .filter(|&r| self.is_save_on_entry(r))
            .count() as u32
    }

    /// Stack slots occupied by a pointer.
    fn pointer_slots(&self) -> u16 {
        1
    }

    /// Number of adjacent registers a value of `class` occupies when it
    /// colors. Kill sets are sized by their mask instead.
    fn num_regs(&self, class: RegClass) -> u16 {
        match class {
            RegClass::Int | RegClass::Float | RegClass::Flags => 1,
            RegClass::Long | RegClass::Double => 2,
            RegClass::Ptr => self.pointer_slots(),
            RegClass::VecS => RegMask::SLOTS_PER_VEC_S,
            RegClass::VecD => RegMask::SLOTS_PER_VEC_D,
            RegClass::VecX => RegMask::SLOTS_PER_VEC_X,
            RegClass::VecY => RegMask::SLOTS_PER_VEC_Y,
            RegClass::VecZ => RegMask::SLOTS_PER_VEC_Z,
            RegClass::VecA => self.scalable_vector_slots() as u16,
            RegClass::PredMask => RegMask::SLOTS_PER_PRED_MASK,
            RegClass::KillSet => 0,
        }
    }

    /// Does this target implement scalable vectors?
    fn supports_scalable_vector(&self) -> bool {
        false
    }

    /// Physical size of a scalable vector, in 32-bit slots.
    fn scalable_vector_slots(&self) -> u32 {
        0
    }

    /// Does this target allocate vector predicate registers?
    fn has_predicated_vectors(&self) -> bool {
        false
    }

    /// Can instructions on this target fold a stack operand directly
    /// (CISC-style spill fusion)?
    fn use_cisc_spill(&self) -> bool {
        false
    }

    /// Highest register number representable in safepoint records.
    fn max_stackmap_reg(&self) -> RegUnit {
        RegMask::CHUNK_SIZE * 16
    }

    /// Is `reg` a stack slot rather than a hardware register?
    fn is_stack(&self, reg: RegUnit) -> bool {
        reg >= self.stack_base()
    }

    /// Frame-pointer-relative byte offset of the stack slot `reg`.
    fn reg2offset(&self, reg: RegUnit) -> i32 {
        debug_assert!(self.is_stack(reg));
        ((reg - self.stack_base()) * 4) as i32
    }
}
