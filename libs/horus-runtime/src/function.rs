use std::{
    fmt,
    marker::PhantomData,
    mem::{align_of, size_of},
};

use stack_dst::buffers::Ptr8;

type InlineBuf = Ptr8;
type Inline<A, R> = stack_dst::Value<dyn FnMut(A) -> R, InlineBuf>;

struct Fits<F>(PhantomData<F>);

impl<F> Fits<F> {
    const INLINE: bool = size_of::<F>() + size_of::<usize>() <= size_of::<InlineBuf>()
        && align_of::<F>() <= align_of::<InlineBuf>();
}

enum Repr<A, R> {
    Inline(Inline<A, R>),
    Heap(Box<dyn FnMut(A) -> R>),
}

/// A type-erased callback that can be moved but not cloned.
///
/// Closures that capture a few words are stored inline. Multiple arguments are passed as a
/// tuple: `MoveOnlyFn<(Ctx, Msg), Out>`.
pub struct MoveOnlyFn<A, R> {
    repr: Repr<A, R>,
}

impl<A: 'static, R: 'static> MoveOnlyFn<A, R> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(A) -> R + 'static,
    {
        let repr = if Fits::<F>::INLINE {
            match Inline::<A, R>::new_stable(f, |f| f as _) {
                Ok(value) => Repr::Inline(value),
                Err(f) => Repr::Heap(Box::new(f)),
            }
        } else {
            Repr::Heap(Box::new(f))
        };
        MoveOnlyFn { repr }
    }
}

impl<A, R> MoveOnlyFn<A, R> {
    pub fn call(&mut self, args: A) -> R {
        match &mut self.repr {
            Repr::Inline(f) => (&mut **f)(args),
            Repr::Heap(f) => f(args),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.repr, Repr::Inline(_))
    }
}

impl<A: 'static, R: 'static, F> From<F> for MoveOnlyFn<A, R>
where
    F: FnMut(A) -> R + 'static,
{
    fn from(f: F) -> Self {
        MoveOnlyFn::new(f)
    }
}

impl<A, R> fmt::Debug for MoveOnlyFn<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MoveOnlyFn")
            .field("inline", &self.is_inline())
            .finish()
    }
}
