use crate::system::OS_PAGE_SIZE;

#[derive(Debug, Default, Clone)]
pub struct VmCreateInfo {
    pub page_size: Option<u32>,
    pub initial_arena_size: Option<u32>,
    pub max_arena_size: Option<u32>,
    pub initial_entities: Option<usize>,
    pub max_entities: Option<usize>,
    // free list misses before the allocator asks for a collection
    pub gc_period: Option<u32>,
    pub segment_size: Option<usize>,
    pub operand_stack_limit: Option<usize>,
    pub exec_stack_limit: Option<usize>,
    pub dict_stack_limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct VmSettings {
    /// Growth granularity of every arena, must be a multiple of the OS page.
    pub page_size: u32,
    pub initial_arena_size: u32,
    /// Arenas never grow past this many bytes.
    pub max_arena_size: u32,
    pub initial_entities: usize,
    pub max_entities: usize,
    pub gc_period: u32,
    pub segment_size: usize,
    pub operand_stack_limit: usize,
    pub exec_stack_limit: usize,
    pub dict_stack_limit: usize,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            page_size: OS_PAGE_SIZE as u32,
            initial_arena_size: 64 * 1024,
            max_arena_size: 256 * 1024 * 1024,
            initial_entities: 256,
            max_entities: 1 << 22,
            gc_period: 64,
            segment_size: 128,
            operand_stack_limit: 500,
            exec_stack_limit: 250,
            dict_stack_limit: 20,
        }
    }
}

impl VmSettings {
    pub fn from_info(info: &VmCreateInfo) -> Result<Self, &'static str> {
        let mut settings = Self::default();
        info.page_size.inspect(|&val| settings.page_size = val);
        info.initial_arena_size
            .inspect(|&val| settings.initial_arena_size = val);
        info.max_arena_size
            .inspect(|&val| settings.max_arena_size = val);
        info.initial_entities
            .inspect(|&val| settings.initial_entities = val);
        info.max_entities.inspect(|&val| settings.max_entities = val);
        info.gc_period.inspect(|&val| settings.gc_period = val);
        info.segment_size.inspect(|&val| settings.segment_size = val);
        info.operand_stack_limit
            .inspect(|&val| settings.operand_stack_limit = val);
        info.exec_stack_limit
            .inspect(|&val| settings.exec_stack_limit = val);
        info.dict_stack_limit
            .inspect(|&val| settings.dict_stack_limit = val);
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.page_size == 0 || self.initial_arena_size == 0 {
            return Err("Sizes must be > 0");
        }
        if !(self.page_size as usize).is_multiple_of(OS_PAGE_SIZE) {
            return Err("page_size must match OS page alignment");
        }
        if self.initial_arena_size > self.max_arena_size {
            return Err("initial_arena_size must not exceed max_arena_size");
        }
        if self.initial_entities < 2 || self.initial_entities > self.max_entities {
            return Err("initial_entities must be in 2..=max_entities");
        }
        if self.gc_period == 0 {
            return Err("gc_period must be > 0");
        }
        if self.segment_size == 0 {
            return Err("segment_size must be > 0");
        }
        if self.operand_stack_limit == 0
            || self.exec_stack_limit == 0
            || self.dict_stack_limit == 0
        {
            return Err("stack limits must be > 0");
        }
        Ok(())
    }
}
