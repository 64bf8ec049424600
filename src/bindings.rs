//! Solidity ABI bindings for the token reads reconciliation needs.

use alloy::sol;

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function totalSupply() external view returns (uint256);
        function balanceOf(address account) external view returns (uint256);
    }
}
