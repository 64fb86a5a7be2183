//! pager/page_cache — direct-mapped кэш страниц транзакции + пул его
//! переиспользования между транзакциями.
//!
//! PageLocator:
//! - один слот на bucket, index = page_number & (size-1);
//! - размер — ближайшая степень двойки, максимум 1024;
//! - ложные промахи при коллизиях допустимы: fallback — повторная загрузка
//!   страницы, это корректно, только медленнее;
//! - слоты валидны только внутри выдавшей транзакции (PageRef указывает в её
//!   chunk-арену).
//!
//! TransactionContextPool:
//! - ограниченный стек PageLocator'ов; 512 слотов для долгоживущих
//!   транзакций, 256 для коротких; глубина пула не больше 1024.

use std::sync::Mutex;

use crate::consts::NO_PAGE;

/// Максимальный размер кэша (слотов).
const MAX_CACHE_SIZE: usize = 1024;
/// Размер кэша долгоживущей транзакции.
const LONG_LIVED_CACHE_SIZE: usize = 512;
/// Размер кэша обычной транзакции.
const DEFAULT_CACHE_SIZE: usize = 256;
/// Предел глубины пула локаторов.
const MAX_POOL_DEPTH: usize = 1024;

/// Ссылка на буфер страницы внутри chunk-арены транзакции.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRef {
    pub chunk: u32,
    pub offset: u32,
    pub len: u32,
}

#[derive(Clone, Copy)]
struct Slot {
    page_number: u64, // NO_PAGE = пусто
    page: PageRef,
    writable: bool,
}

const EMPTY_SLOT: Slot = Slot {
    page_number: NO_PAGE,
    page: PageRef {
        chunk: 0,
        offset: 0,
        len: 0,
    },
    writable: false,
};

pub struct PageLocator {
    slots: Box<[Slot]>,
    mask: u64,
}

impl PageLocator {
    pub fn new(size_hint: usize) -> Self {
        let size = size_hint.next_power_of_two().min(MAX_CACHE_SIZE).max(1);
        Self {
            slots: vec![EMPTY_SLOT; size].into_boxed_slice(),
            mask: (size as u64) - 1,
        }
    }

    #[inline]
    fn index(&self, page_number: u64) -> usize {
        (page_number & self.mask) as usize
    }

    /// Страница для чтения (writable-слот тоже годится).
    pub fn try_get_readable(&self, page_number: u64) -> Option<PageRef> {
        let s = &self.slots[self.index(page_number)];
        if s.page_number == page_number {
            Some(s.page)
        } else {
            None
        }
    }

    /// Страница для записи: только если закэширована именно writable-версия.
    pub fn try_get_writable(&self, page_number: u64) -> Option<PageRef> {
        let s = &self.slots[self.index(page_number)];
        if s.page_number == page_number && s.writable {
            Some(s.page)
        } else {
            None
        }
    }

    /// Поместить read-only страницу (безусловная перезапись слота).
    pub fn set_readable(&mut self, page_number: u64, page: PageRef) {
        let idx = self.index(page_number);
        self.slots[idx] = Slot {
            page_number,
            page,
            writable: false,
        };
    }

    /// Поместить writable-страницу (безусловная перезапись слота).
    pub fn set_writable(&mut self, page_number: u64, page: PageRef) {
        let idx = self.index(page_number);
        self.slots[idx] = Slot {
            page_number,
            page,
            writable: true,
        };
    }

    /// Инвалидировать слот, если он держит именно эту страницу.
    pub fn reset(&mut self, page_number: u64) {
        let idx = self.index(page_number);
        if self.slots[idx].page_number == page_number {
            self.slots[idx] = EMPTY_SLOT;
        }
    }

    /// Подготовить локатор к новой транзакции: очистка + подгон размера.
    pub fn renew(&mut self, size_hint: usize) {
        let size = size_hint.next_power_of_two().min(MAX_CACHE_SIZE).max(1);
        if size != self.slots.len() {
            self.slots = vec![EMPTY_SLOT; size].into_boxed_slice();
            self.mask = (size as u64) - 1;
        } else {
            self.slots.fill(EMPTY_SLOT);
        }
    }

    /// Отдать память слотов раньше возврата в пул.
    pub fn release(&mut self) {
        self.slots = vec![EMPTY_SLOT; 1].into_boxed_slice();
        self.mask = 0;
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Пул PageLocator'ов, переиспользуемых между транзакциями.
pub struct TransactionContextPool {
    stack: Mutex<Vec<PageLocator>>,
}

impl TransactionContextPool {
    pub fn new() -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
        }
    }

    /// Взять локатор под транзакцию (или создать новый).
    pub fn allocate_page_locator(&self, long_lived: bool) -> PageLocator {
        let size = if long_lived {
            LONG_LIVED_CACHE_SIZE
        } else {
            DEFAULT_CACHE_SIZE
        };
        let mut stack = self.stack.lock().unwrap();
        match stack.pop() {
            Some(mut loc) => {
                loc.renew(size);
                loc
            }
            None => PageLocator::new(size),
        }
    }

    /// Вернуть локатор; при переполненном пуле он просто выбрасывается.
    pub fn free_page_locator(&self, mut locator: PageLocator) {
        locator.release();
        let mut stack = self.stack.lock().unwrap();
        if stack.len() < MAX_POOL_DEPTH {
            stack.push(locator);
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.lock().unwrap().len()
    }
}

impl Default for TransactionContextPool {
    fn default() -> Self {
        Self::new()
    }
}
