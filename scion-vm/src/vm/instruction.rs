//! Scion 字节码指令集。
//!
//! 每条指令占一个 u32 字，操作数紧随其后，宽度固定：64 位立即数
//! 拆成低字在前、高字在后的两个 u32。指令流按字索引寻址，跳转目标
//! 必须落在指令边界上，由安装期校验保证。

/// 虚拟机指令集
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Instruction {
    // 栈操作 (0-9)
    Nop = 0,
    PushNull = 1,
    PushBool = 2,
    PushInt = 3,
    PushUint = 4,
    PushFloat = 5,
    PushDouble = 6,
    Pop = 7,
    Dup = 8,
    Swap = 9,

    // 变量与属性 (10-19)
    LoadVar = 10,    // 加载局部变量
    StoreVar = 11,   // 存储局部变量
    LoadField = 12,  // 读取对象字段
    StoreField = 13, // 写入对象字段
    LoadGlobal = 14, // 加载模块全局
    StoreGlobal = 15,
    FreeVar = 16, // 作用域结束时释放局部变量
    LoadThis = 17, // 方法体内加载自身实例

    // 算术 (20-29)
    Add = 20,
    Sub = 21,
    Mul = 22,
    Div = 23,
    Mod = 24,
    Neg = 25,

    // 比较与逻辑 (30-39)
    CmpEq = 30,
    CmpNe = 31,
    CmpLt = 32,
    CmpLe = 33,
    CmpGt = 34,
    CmpGe = 35,
    Not = 36,

    // 控制流 (40-49)
    Jump = 40,
    JumpIfFalse = 41,
    JumpIf = 42,
    Ret = 43,

    // 调用与对象 (50-59)
    Call = 50,       // 调用模块函数表中的函数
    CallMethod = 51, // 弹出实例后调用方法
    New = 52,        // 构造模块类型表中的类型
    ValueAssign = 53, // 值类型赋值，需要 opAssign 或 POD
    Throw = 54,      // 抛出脚本异常，操作数为名字池索引
}

impl Instruction {
    /// 根据操作码获取指令
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0 => Some(Self::Nop),
            1 => Some(Self::PushNull),
            2 => Some(Self::PushBool),
            3 => Some(Self::PushInt),
            4 => Some(Self::PushUint),
            5 => Some(Self::PushFloat),
            6 => Some(Self::PushDouble),
            7 => Some(Self::Pop),
            8 => Some(Self::Dup),
            9 => Some(Self::Swap),

            10 => Some(Self::LoadVar),
            11 => Some(Self::StoreVar),
            12 => Some(Self::LoadField),
            13 => Some(Self::StoreField),
            14 => Some(Self::LoadGlobal),
            15 => Some(Self::StoreGlobal),
            16 => Some(Self::FreeVar),
            17 => Some(Self::LoadThis),

            20 => Some(Self::Add),
            21 => Some(Self::Sub),
            22 => Some(Self::Mul),
            23 => Some(Self::Div),
            24 => Some(Self::Mod),
            25 => Some(Self::Neg),

            30 => Some(Self::CmpEq),
            31 => Some(Self::CmpNe),
            32 => Some(Self::CmpLt),
            33 => Some(Self::CmpLe),
            34 => Some(Self::CmpGt),
            35 => Some(Self::CmpGe),
            36 => Some(Self::Not),

            40 => Some(Self::Jump),
            41 => Some(Self::JumpIfFalse),
            42 => Some(Self::JumpIf),
            43 => Some(Self::Ret),

            50 => Some(Self::Call),
            51 => Some(Self::CallMethod),
            52 => Some(Self::New),
            53 => Some(Self::ValueAssign),
            54 => Some(Self::Throw),

            _ => None,
        }
    }

    /// 指令后跟随的操作数字数。
    pub fn operand_words(self) -> usize {
        match self {
            Instruction::PushInt | Instruction::PushUint | Instruction::PushDouble => 2,
            Instruction::PushBool
            | Instruction::PushFloat
            | Instruction::LoadVar
            | Instruction::StoreVar
            | Instruction::LoadField
            | Instruction::StoreField
            | Instruction::LoadGlobal
            | Instruction::StoreGlobal
            | Instruction::FreeVar
            | Instruction::Jump
            | Instruction::JumpIfFalse
            | Instruction::JumpIf
            | Instruction::Call
            | Instruction::CallMethod
            | Instruction::New
            | Instruction::ValueAssign
            | Instruction::Throw => 1,
            _ => 0,
        }
    }
}

/// 解码后的操作数。64 位立即数由 `as_u64` 拼接。
#[derive(Debug, Clone, Copy, Default)]
pub struct Operands {
    pub a: u32,
    pub b: u32,
}

impl Operands {
    #[inline(always)]
    pub fn as_u64(&self) -> u64 {
        ((self.b as u64) << 32) | (self.a as u64)
    }
}

/// 按低字在前的顺序拆分 64 位立即数。
#[inline(always)]
pub fn split_u64(value: u64) -> (u32, u32) {
    ((value & 0xFFFF_FFFF) as u32, (value >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for raw in 0u8..=255 {
            if let Some(instr) = Instruction::from_opcode(raw) {
                assert_eq!(instr as u8, raw);
            }
        }
        assert_eq!(Instruction::from_opcode(99), None);
    }

    #[test]
    fn test_u64_split_join() {
        let v = 0x1234_5678_9abc_def0u64;
        let (lo, hi) = split_u64(v);
        let ops = Operands { a: lo, b: hi };
        assert_eq!(ops.as_u64(), v);
    }
}
