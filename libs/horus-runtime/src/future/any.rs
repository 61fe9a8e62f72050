use std::{
    any::Any,
    fmt,
    future::Future,
    marker::{PhantomData, PhantomPinned},
    mem::{align_of, size_of},
    pin::Pin,
    task::{Context, Poll},
};

use stack_dst::buffers::Ptr8;

type InlineBuf = Ptr8;
type Inline<T> = stack_dst::Value<dyn Future<Output = T>, InlineBuf>;

/// Whether `F` fits the inline buffer. `stack_dst` stores the vtable pointer in the same buffer,
/// so one word is reserved for it.
struct Fits<F>(PhantomData<F>);

impl<F> Fits<F> {
    const INLINE: bool = size_of::<F>() + size_of::<usize>() <= size_of::<InlineBuf>()
        && align_of::<F>() <= align_of::<InlineBuf>();
}

enum Repr<T> {
    Inline(Inline<T>),
    Heap(Pin<Box<dyn Future<Output = T>>>),
}

/// A type-erased future.
///
/// Futures up to seven words are stored inline, which covers most request/response state
/// machines on the send path; larger ones are boxed. Either way the handle has the same type,
/// so APIs can return "some future of `T`" without generic parameters.
#[must_use = "futures do nothing unless polled"]
pub struct AnyFuture<T> {
    repr: Repr<T>,
    // the inline future must stay put once polled
    _pinned: PhantomPinned,
}

impl<T: 'static> AnyFuture<T> {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + 'static,
    {
        let mut slot = Some(future);
        // re-wrapping an `AnyFuture` would add a second layer of dispatch for nothing
        if let Some(any) = (&mut slot as &mut dyn Any).downcast_mut::<Option<AnyFuture<T>>>() {
            if let Some(inner) = any.take() {
                return inner;
            }
        }
        let Some(future) = slot else {
            unreachable!("slot is only emptied for `AnyFuture` inputs")
        };
        if Fits::<F>::INLINE {
            match Inline::<T>::new_stable(future, |f| f as _) {
                Ok(value) => return Self::from_repr(Repr::Inline(value)),
                Err(future) => return Self::from_repr(Repr::Heap(Box::pin(future))),
            }
        }
        Self::from_repr(Repr::Heap(Box::pin(future)))
    }

    /// A future that is immediately ready with `value`.
    pub fn ready(value: T) -> Self {
        Self::new(std::future::ready(value))
    }

    /// Boxes `future` even if it would fit inline.
    pub fn boxed<F>(future: F) -> Self
    where
        F: Future<Output = T> + 'static,
    {
        Self::from_repr(Repr::Heap(Box::pin(future)))
    }
}

impl<T> AnyFuture<T> {
    fn from_repr(repr: Repr<T>) -> Self {
        AnyFuture {
            repr,
            _pinned: PhantomPinned,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.repr, Repr::Inline(_))
    }
}

impl<T> Future for AnyFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        // SAFETY: `AnyFuture` is `!Unpin`, so the inline value is never moved after this point.
        let this = unsafe { self.get_unchecked_mut() };
        match &mut this.repr {
            Repr::Inline(value) => unsafe { Pin::new_unchecked(&mut **value) }.poll(cx),
            Repr::Heap(future) => future.as_mut().poll(cx),
        }
    }
}

impl<T> From<Pin<Box<dyn Future<Output = T>>>> for AnyFuture<T> {
    fn from(future: Pin<Box<dyn Future<Output = T>>>) -> Self {
        Self::from_repr(Repr::Heap(future))
    }
}

impl<T> fmt::Debug for AnyFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyFuture")
            .field("inline", &self.is_inline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;

    struct DropCounter(Rc<Cell<usize>>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn small(drops: Rc<Cell<usize>>) -> impl Future<Output = u32> {
        let counter = DropCounter(drops);
        async move {
            crate::yield_now().await;
            let _counter = &counter;
            7
        }
    }

    fn large(drops: Rc<Cell<usize>>) -> impl Future<Output = u32> {
        let counter = DropCounter(drops);
        let padding = [1u8; 256];
        async move {
            crate::yield_now().await;
            let _counter = &counter;
            padding.iter().map(|b| *b as u32).sum::<u32>() - 249
        }
    }

    #[crate::test]
    async fn test_inline_and_heap_poll_to_same_result() {
        let drops = Rc::new(Cell::new(0));
        let inline = AnyFuture::new(small(drops.clone()));
        let heap = AnyFuture::new(large(drops.clone()));
        assert!(inline.is_inline());
        assert!(!heap.is_inline());
        assert_eq!(inline.await, 7);
        assert_eq!(heap.await, 7);
        assert_eq!(drops.get(), 2);
    }

    #[crate::test]
    async fn test_move_before_poll_keeps_state() {
        let drops = Rc::new(Cell::new(0));
        let futures = vec![
            AnyFuture::new(small(drops.clone())),
            AnyFuture::new(large(drops.clone())),
        ];
        // moves every handle into new storage
        let moved: Vec<AnyFuture<u32>> = futures.into_iter().rev().collect();
        let boxed = Box::new(moved);
        let mut total = 0;
        for future in *boxed {
            total += future.await;
        }
        assert_eq!(total, 14);
        assert_eq!(drops.get(), 2);
    }

    #[test]
    fn test_drop_without_poll_runs_destructor_once() {
        let drops = Rc::new(Cell::new(0));
        let inline = AnyFuture::new(small(drops.clone()));
        let heap = AnyFuture::new(large(drops.clone()));
        drop(inline);
        drop(heap);
        assert_eq!(drops.get(), 2);
    }

    #[crate::test]
    async fn test_drop_mid_poll_runs_destructor_once() {
        let drops = Rc::new(Cell::new(0));
        let mut inline = Box::pin(AnyFuture::new(small(drops.clone())));
        assert!(futures_lite::future::poll_once(inline.as_mut()).await.is_none());
        drop(inline);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_nested_any_future_is_not_rewrapped() {
        // an `AnyFuture` is too large to be stored inline in another one
        assert!(!Fits::<AnyFuture<u8>>::INLINE);
        let inner = AnyFuture::new(async { 1u8 });
        assert!(inner.is_inline());
        let outer = AnyFuture::new(inner);
        assert!(outer.is_inline());
        assert_eq!(futures_lite::future::block_on(outer), 1);
    }

    #[test]
    fn test_fits_is_size_and_align_bounded() {
        assert!(Fits::<[usize; 7]>::INLINE);
        assert!(!Fits::<[usize; 8]>::INLINE);
        #[repr(align(128))]
        struct Overaligned(u8);
        assert!(!Fits::<Overaligned>::INLINE);
    }
}
