//! End-to-end allocator scenarios on a synthetic target.

use chaitin::ir::{Function, Node, NodeData, NodeKind, SpillKind, ValueLoc, ValueType};
use chaitin::isa::test_utils::TestIsa;
use chaitin::isa::{RegClass, RegMask, RegUnit, TargetIsa};
use chaitin::regalloc::{Context, StackmapSink};

fn int_def(isa: &TestIsa) -> NodeData {
    let mut d = NodeData::new(NodeKind::Mach);
    d.ty = ValueType::Int;
    d.ideal = Some(RegClass::Int);
    d.out_mask = *isa.reg_mask(RegClass::Int);
    d
}

fn one_reg(r: RegUnit) -> RegMask {
    let mut m = RegMask::empty();
    m.insert(r);
    m
}

/// Wire `v` into input `idx` of `n` with a required mask.
fn wire(func: &mut Function, n: Node, idx: usize, v: Node, mask: RegMask) {
    func.set_input(n, idx, Some(v));
    func.node_mut(n).set_in_mask(idx, mask);
}

/// A value-less consumer of its inputs.
fn sink_node(func: &mut Function, isa: &TestIsa, values: &[Node]) -> Node {
    let n = func.create_node(NodeData::new(NodeKind::Mach));
    for (i, &v) in values.iter().enumerate() {
        wire(func, n, i + 1, v, *isa.reg_mask(RegClass::Int));
    }
    n
}

fn reg_of(alloc: &chaitin::regalloc::Allocation, n: Node) -> RegUnit {
    match alloc.locations[n] {
        ValueLoc::Reg(r) => r,
        other => panic!("expected a single register, got {:?}", other),
    }
}

#[test]
fn straight_line_add() {
    let isa = TestIsa::new();
    let mut func = Function::new();
    let b0 = func.create_block(1.0);

    let mut a_data = int_def(&isa);
    a_data.out_mask = one_reg(0);
    let a = func.create_node(a_data);
    func.append_node(b0, a);

    let mut b_data = int_def(&isa);
    b_data.out_mask = one_reg(1);
    let b = func.create_node(b_data);
    func.append_node(b0, b);

    let mut v_data = int_def(&isa);
    v_data.out_mask = one_reg(0);
    let v = func.create_node(v_data);
    wire(&mut func, v, 1, a, *isa.reg_mask(RegClass::Int));
    wire(&mut func, v, 2, b, *isa.reg_mask(RegClass::Int));
    func.append_node(b0, v);

    let ret = sink_node(&mut func, &isa, &[v]);
    func.append_node(b0, ret);

    let alloc = Context::new().run(&mut func, &isa, None).unwrap();
    assert_eq!(alloc.spill_trips, 0);
    assert_eq!(reg_of(&alloc, a), 0);
    assert_eq!(reg_of(&alloc, b), 1);
    assert_eq!(reg_of(&alloc, v), 0);
    assert_eq!(alloc.frame_slots, 0);
}

#[test]
fn two_address_merge() {
    let isa = TestIsa::new();
    let mut func = Function::new();
    let b0 = func.create_block(1.0);

    let a = func.create_node(int_def(&isa));
    func.append_node(b0, a);
    let b = func.create_node(int_def(&isa));
    func.append_node(b0, b);

    // v = add2(a, b): v and a must share a register.
    let mut v_data = int_def(&isa);
    v_data.two_addr = Some(1);
    let v = func.create_node(v_data);
    wire(&mut func, v, 1, a, *isa.reg_mask(RegClass::Int));
    wire(&mut func, v, 2, b, *isa.reg_mask(RegClass::Int));
    func.append_node(b0, v);

    let ret = sink_node(&mut func, &isa, &[v]);
    func.append_node(b0, ret);

    let count_before = func.blocks[b0].nodes.len();
    let alloc = Context::new().run(&mut func, &isa, None).unwrap();

    // a and v coalesced; b stayed apart; nothing was inserted.
    assert_eq!(reg_of(&alloc, a), reg_of(&alloc, v));
    assert_ne!(reg_of(&alloc, b), reg_of(&alloc, v));
    assert_eq!(func.blocks[b0].nodes.len(), count_before);
    assert_eq!(alloc.spill_trips, 0);
}

#[test]
fn three_live_on_two_registers() {
    let isa = TestIsa::with_int_regs(2);
    let mut func = Function::new();
    let b0 = func.create_block(1.0);

    let x = func.create_node(int_def(&isa));
    func.append_node(b0, x);
    let y = func.create_node(int_def(&isa));
    func.append_node(b0, y);
    let z = func.create_node(int_def(&isa));
    func.append_node(b0, z);

    // Uses in reverse definition order: x covers the largest area and is
    // the expected spill victim.
    let use_z = sink_node(&mut func, &isa, &[z]);
    func.append_node(b0, use_z);
    let use_y = sink_node(&mut func, &isa, &[y]);
    func.append_node(b0, use_y);
    let use_x = sink_node(&mut func, &isa, &[x]);
    func.append_node(b0, use_x);

    let alloc = Context::new().run(&mut func, &isa, None).unwrap();

    // One split round resolves it; the loop must not churn.
    assert!(alloc.spill_trips >= 1 && alloc.spill_trips <= 2);
    // Something went to the stack.
    assert!(alloc.frame_slots > 0);

    // Every remaining use reads a hardware register, and simultaneous
    // values got distinct registers.
    let xin = func.input(use_x, 1).unwrap();
    assert_ne!(xin, x, "spilled value must be reloaded, not read directly");
    for &u in &[use_z, use_y, use_x] {
        let v = func.input(u, 1).unwrap();
        let r = reg_of(&alloc, v);
        assert!(!isa.is_stack(r));
    }
}

#[test]
fn phi_coalesces_across_diamond() {
    let isa = TestIsa::new();
    let mut func = Function::new();
    let b0 = func.create_block(1.0);
    let b1 = func.create_block(0.5);
    let b2 = func.create_block(0.5);
    let b3 = func.create_block(1.0);
    func.add_edge(b0, b1);
    func.add_edge(b0, b2);
    func.add_edge(b1, b3);
    func.add_edge(b2, b3);

    let a1 = func.create_node(int_def(&isa));
    func.append_node(b1, a1);
    let a2 = func.create_node(int_def(&isa));
    func.append_node(b2, a2);

    let mut phi_data = int_def(&isa);
    phi_data.kind = NodeKind::Phi;
    let phi = func.create_node(phi_data);
    func.set_input(phi, 1, Some(a1));
    func.set_input(phi, 2, Some(a2));
    func.append_node(b3, phi);

    let ret = sink_node(&mut func, &isa, &[phi]);
    func.append_node(b3, ret);

    let sizes: Vec<usize> = [b0, b1, b2, b3]
        .iter()
        .map(|&b| func.blocks[b].nodes.len())
        .collect();
    let alloc = Context::new().run(&mut func, &isa, None).unwrap();

    // One live range end to end; no copies on either arm.
    assert_eq!(reg_of(&alloc, a1), reg_of(&alloc, phi));
    assert_eq!(reg_of(&alloc, a2), reg_of(&alloc, phi));
    let sizes_after: Vec<usize> = [b0, b1, b2, b3]
        .iter()
        .map(|&b| func.blocks[b].nodes.len())
        .collect();
    assert_eq!(sizes, sizes_after);
}

#[derive(Default)]
struct RecordingSink {
    oops: Vec<RegUnit>,
    narrow: Vec<RegUnit>,
    derived: Vec<(RegUnit, RegUnit)>,
    callee_saved: Vec<(RegUnit, RegUnit)>,
    frame: Option<u32>,
}

impl StackmapSink for RecordingSink {
    fn frame_size(&mut self, slots: u32) {
        self.frame = Some(slots);
    }
    fn set_oop(&mut self, reg: RegUnit) {
        self.oops.push(reg);
    }
    fn set_narrow_oop(&mut self, reg: RegUnit) {
        self.narrow.push(reg);
    }
    fn set_derived_oop(&mut self, derived: RegUnit, base: RegUnit) {
        self.derived.push((derived, base));
    }
    fn set_callee_saved(&mut self, reg: RegUnit, saved_in: RegUnit) {
        self.callee_saved.push((reg, saved_in));
    }
}

#[test]
fn derived_pointer_across_safepoint() {
    let isa = TestIsa::new();
    let mut func = Function::new();
    let b0 = func.create_block(1.0);

    // base = load_obj()
    let mut base_data = NodeData::new(NodeKind::Mach);
    base_data.ty = ValueType::OopPtr { offset: 0 };
    base_data.ideal = Some(RegClass::Ptr);
    base_data.out_mask = *isa.reg_mask(RegClass::Ptr);
    let base = func.create_node(base_data);
    func.append_node(b0, base);

    // deriv = addp(base, 16)
    let mut deriv_data = NodeData::new(NodeKind::Mach);
    deriv_data.ty = ValueType::OopPtr { offset: 16 };
    deriv_data.ideal = Some(RegClass::Ptr);
    deriv_data.out_mask = *isa.reg_mask(RegClass::Ptr);
    deriv_data.base_input = Some(1);
    let deriv = func.create_node(deriv_data);
    wire(&mut func, deriv, 1, base, *isa.reg_mask(RegClass::Ptr));
    func.append_node(b0, deriv);

    // safepoint
    let mut safe_data = NodeData::new(NodeKind::Safepoint);
    safe_data.debug_start = Some(1);
    let safepoint = func.create_node(safe_data);
    func.set_input(safepoint, 0, None); // control slot
    func.append_node(b0, safepoint);

    // use(deriv)
    let use_d = sink_node(&mut func, &isa, &[deriv]);
    func.append_node(b0, use_d);

    let mut sink = RecordingSink::default();
    let alloc = Context::new()
        .run(&mut func, &isa, Some(&mut sink))
        .unwrap();

    // The safepoint gained the (derived, base) debug pair.
    let oopoff = func.node(safepoint).oopoff.expect("no oop pairs appended") as usize;
    assert_eq!(func.input(safepoint, oopoff), Some(deriv));
    assert_eq!(func.input(safepoint, oopoff + 1), Some(base));

    // And the collector was told about both halves.
    let dreg = reg_of(&alloc, deriv);
    let breg = reg_of(&alloc, base);
    assert_ne!(dreg, breg);
    assert!(sink.derived.contains(&(dreg, breg)));
    // The base is an ordinary oop record.
    assert!(sink.oops.contains(&breg));
}

#[test]
fn copy_chain_elision() {
    let isa = TestIsa::new();
    let mut func = Function::new();
    let b0 = func.create_block(1.0);

    let x = func.create_node(int_def(&isa));
    func.append_node(b0, x);

    let mut c1_data = NodeData::new(NodeKind::SpillCopy(SpillKind::Def));
    c1_data.ty = ValueType::Int;
    c1_data.ideal = Some(RegClass::Int);
    c1_data.out_mask = *isa.spill_mask(RegClass::Int);
    let c1 = func.create_node(c1_data);
    wire(&mut func, c1, 1, x, *isa.spill_mask(RegClass::Int));
    func.append_node(b0, c1);

    let mut c2_data = NodeData::new(NodeKind::SpillCopy(SpillKind::Use));
    c2_data.ty = ValueType::Int;
    c2_data.ideal = Some(RegClass::Int);
    c2_data.out_mask = *isa.spill_mask(RegClass::Int);
    let c2 = func.create_node(c2_data);
    wire(&mut func, c2, 1, c1, *isa.spill_mask(RegClass::Int));
    func.append_node(b0, c2);

    let use_c = sink_node(&mut func, &isa, &[c2]);
    func.append_node(b0, use_c);

    Context::new().run(&mut func, &isa, None).unwrap();

    // The use reads x directly and both copies are gone from the block.
    assert_eq!(func.input(use_c, 1), Some(x));
    assert_eq!(func.block_of(c1), None);
    assert_eq!(func.block_of(c2), None);
    assert_eq!(func.blocks[b0].nodes.len(), 2);
}

#[test]
fn flags_cannot_spill() {
    // A φ of flags values would need a copy, and flags have no spill mask.
    let isa = TestIsa::new();
    let mut func = Function::new();
    let b0 = func.create_block(1.0);
    let b1 = func.create_block(0.5);
    let b2 = func.create_block(0.5);
    let b3 = func.create_block(1.0);
    func.add_edge(b0, b1);
    func.add_edge(b0, b2);
    func.add_edge(b1, b3);
    func.add_edge(b2, b3);

    let flags = |func: &mut Function| {
        let mut d = NodeData::new(NodeKind::Mach);
        d.ty = ValueType::Flags;
        d.ideal = Some(RegClass::Flags);
        d.out_mask = one_reg(TestIsa::FLAGS_REG);
        func.create_node(d)
    };
    let f1 = flags(&mut func);
    func.append_node(b1, f1);
    let f2 = flags(&mut func);
    func.append_node(b2, f2);

    let mut phi_data = NodeData::new(NodeKind::Phi);
    phi_data.ty = ValueType::Flags;
    phi_data.ideal = Some(RegClass::Flags);
    phi_data.out_mask = one_reg(TestIsa::FLAGS_REG);
    let phi = func.create_node(phi_data);
    func.set_input(phi, 1, Some(f1));
    func.set_input(phi, 2, Some(f2));
    func.append_node(b3, phi);

    // Keep both arms distinct so the φ inputs cannot all coalesce: make f1
    // also live into b3 directly.
    let keep = sink_node(&mut func, &isa, &[]);
    func.set_input(keep, 1, Some(f1));
    func.set_input(keep, 2, Some(phi));
    func.append_node(b3, keep);

    let err = Context::new().run(&mut func, &isa, None).err().unwrap();
    assert_eq!(err, chaitin::CodegenError::NotSpillable);
}
