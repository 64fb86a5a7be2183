//! pager/buffer_pool — пул plaintext-буферов страниц по size-классам.
//!
//! - Классы — степени двойки от одного page_size и выше; запрошенный размер
//!   округляется вверх до класса.
//! - Get возвращает занулённый буфер и ThreadId, выдавший его: при Return
//!   совпадение потока — только подсказка локальности, на корректность не
//!   влияет (пул защищён Mutex и безопасен из любых потоков).
//! - Глубина каждого класса ограничена, лишние буферы просто освобождаются.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::{self, ThreadId};

/// Максимум удерживаемых буферов на size-класс.
const MAX_POOLED_PER_CLASS: usize = 64;

/// Буфер, выданный пулом.
pub struct PooledBuf {
    pub data: Box<[u8]>,
    /// Поток, получивший буфер (подсказка affinity).
    pub owner_thread: ThreadId,
}

impl PooledBuf {
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub struct EncryptionBufferPool {
    // size-класс (байты) -> стек свободных аллокаций
    classes: Mutex<HashMap<usize, Vec<Box<[u8]>>>>,
}

impl EncryptionBufferPool {
    pub fn new() -> Self {
        Self {
            classes: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    fn size_class(size: usize) -> usize {
        size.next_power_of_two()
    }

    /// Выдать занулённый буфер не меньше `size` байт (ровно size-класс).
    pub fn get(&self, size: usize) -> PooledBuf {
        let class = Self::size_class(size.max(1));
        let reused = {
            let mut classes = self.classes.lock().unwrap();
            classes.get_mut(&class).and_then(|stack| stack.pop())
        };
        let data = match reused {
            Some(mut buf) => {
                buf.fill(0);
                buf
            }
            None => vec![0u8; class].into_boxed_slice(),
        };
        PooledBuf {
            data,
            owner_thread: thread::current().id(),
        }
    }

    /// Вернуть буфер в пул. При переполнении класса аллокация освобождается.
    pub fn put(&self, buf: PooledBuf) {
        let class = buf.data.len();
        debug_assert!(class.is_power_of_two());
        let mut classes = self.classes.lock().unwrap();
        let stack = classes.entry(class).or_default();
        if stack.len() < MAX_POOLED_PER_CLASS {
            stack.push(buf.data);
        }
    }

    /// Сколько буферов удерживается (для тестов/метрик).
    pub fn pooled_count(&self) -> usize {
        self.classes.lock().unwrap().values().map(Vec::len).sum()
    }
}

impl Default for EncryptionBufferPool {
    fn default() -> Self {
        Self::new()
    }
}
