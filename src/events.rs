use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;

sol! {
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
    }

    interface IAavePool {
        event Supply(
            address indexed reserve,
            address user,
            address indexed onBehalfOf,
            uint256 amount,
            uint16 indexed referralCode
        );
        event Withdraw(
            address indexed reserve,
            address indexed user,
            address indexed to,
            uint256 amount
        );
    }

    interface IComet {
        event Supply(address indexed from, address indexed dst, uint256 amount);
        event Withdraw(address indexed src, address indexed to, uint256 amount);
        event SupplyCollateral(
            address indexed from,
            address indexed dst,
            address indexed asset,
            uint256 amount
        );
        event WithdrawCollateral(
            address indexed src,
            address indexed to,
            address indexed asset,
            uint256 amount
        );

        function baseToken() external view returns (address);
    }

    interface IUniswapV3Pool {
        event Mint(
            address sender,
            address indexed owner,
            int24 indexed tickLower,
            int24 indexed tickUpper,
            uint128 amount,
            uint256 amount0,
            uint256 amount1
        );
        event Burn(
            address indexed owner,
            int24 indexed tickLower,
            int24 indexed tickUpper,
            uint128 amount,
            uint256 amount0,
            uint256 amount1
        );
        event Swap(
            address indexed sender,
            address indexed recipient,
            int256 amount0,
            int256 amount1,
            uint160 sqrtPriceX96,
            uint128 liquidity,
            int24 tick
        );

        function token0() external view returns (address);
        function token1() external view returns (address);
    }
}

/// Decodes an RPC log into the event `E`, checking topic0 and the data layout.
pub fn decode_event<E: SolEvent>(log: &Log) -> anyhow::Result<E> {
    let log_data = log.data();
    let decoded = E::decode_raw_log(log.topics(), &log_data.data)?;
    Ok(decoded)
}
