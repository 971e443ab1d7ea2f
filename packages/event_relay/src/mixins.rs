use crate::callback_list::{CallbackHandle, CallbackList};

/// A compile-time layer wrapping dispatch with pre/post hooks.
///
/// The policy bundle names a mixin type (or a tuple of them) and the dispatcher runs the
/// hooks around every dispatch: all `before_dispatch` hooks in order — any returning
/// `false` suppresses listener invocation and the remaining hooks — then the listeners,
/// then all `after_dispatch` hooks.
///
/// `()` is the empty chain; tuples chain several mixins.
pub trait Mixin<E, Args>: Default + Send + Sync + 'static {
    /// Runs before the listeners. Return `false` to suppress this dispatch.
    fn before_dispatch(&self, event: &E, args: &Args) -> bool {
        let _ = (event, args);
        true
    }

    /// Runs after the listeners of a non-suppressed dispatch.
    fn after_dispatch(&self, event: &E, args: &Args) {
        let _ = (event, args);
    }
}

impl<E, Args> Mixin<E, Args> for () {}

macro_rules! impl_mixin_for_tuple {
    ($($name:ident),+) => {
        impl<E, Args, $($name,)+> Mixin<E, Args> for ($($name,)+)
        where
            $($name: Mixin<E, Args>,)+
        {
            fn before_dispatch(&self, event: &E, args: &Args) -> bool {
                #[allow(non_snake_case, reason = "destructuring the mixin tuple")]
                let ($($name,)+) = self;
                $(
                    if !$name.before_dispatch(event, args) {
                        return false;
                    }
                )+
                true
            }

            fn after_dispatch(&self, event: &E, args: &Args) {
                #[allow(non_snake_case, reason = "destructuring the mixin tuple")]
                let ($($name,)+) = self;
                $($name.after_dispatch(event, args);)+
            }
        }
    };
}

impl_mixin_for_tuple!(A);
impl_mixin_for_tuple!(A, B);
impl_mixin_for_tuple!(A, B, C);
impl_mixin_for_tuple!(A, B, C, D);

/// The storage form of a dispatch filter.
pub type BoxedFilter<E, Args> = Box<dyn Fn(&E, &Args) -> bool + Send + Sync>;

/// A [`Mixin`] holding runtime-registered filters.
///
/// Every dispatch runs the filters in registration order; if any filter returns `false`
/// the dispatch is suppressed before reaching the listeners. Filters live in their own
/// [`CallbackList`], so they may be added and removed concurrently with dispatching,
/// with the same visibility rules as listeners.
pub struct FilterMixin<E: 'static, Args: 'static> {
    filters: CallbackList<BoxedFilter<E, Args>>,
}

impl<E: 'static, Args: 'static> FilterMixin<E, Args> {
    /// Registers a filter. Returns a handle for [`remove_filter`](Self::remove_filter).
    pub fn append_filter(
        &self,
        filter: impl Fn(&E, &Args) -> bool + Send + Sync + 'static,
    ) -> CallbackHandle<BoxedFilter<E, Args>> {
        self.filters.append(Box::new(filter))
    }

    /// Removes a previously registered filter. Returns `false` if it was already removed.
    pub fn remove_filter(&self, handle: &CallbackHandle<BoxedFilter<E, Args>>) -> bool {
        self.filters.remove(handle)
    }
}

impl<E: 'static, Args: 'static> Default for FilterMixin<E, Args> {
    fn default() -> Self {
        Self {
            filters: CallbackList::new(),
        }
    }
}

impl<E: 'static, Args: 'static> Mixin<E, Args> for FilterMixin<E, Args> {
    fn before_dispatch(&self, event: &E, args: &Args) -> bool {
        self.filters.for_each_if(|filter| filter(event, args))
    }
}
